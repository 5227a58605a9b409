mod events;
mod http;
mod metrics;
mod models;
mod mutate;
mod ontology;
mod reconcile;
mod scheduler;
mod security;
mod vault;
mod vinted;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use events::EventBus;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ItemPatch, ItemStatus, OntologyType};
use ontology::{OntologyEngine, OntologyError};
use reconcile::{SyncEngine, SyncError};
use scheduler::{RelistScheduler, SchedulerConfig};
use security::{AuthState, require_bridge_auth};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use vault::{Vault, VaultError};
use vinted::{GatewayError, MarketplaceGateway, VintedGateway};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "vault.api", "bridge crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let db_path = std::env::var("VAULT_DB_PATH").unwrap_or_else(|_| "vault.db".to_string());
    let vault = Arc::new(Vault::open(&db_path)?);

    // Entries caught mid-flight by the previous shutdown cannot be trusted
    // to have completed exactly once; they surface as errors, never re-run.
    let recovered = vault.recover_interrupted().await?;
    if !recovered.is_empty() {
        info!(
            target = "vault.api",
            count = recovered.len(),
            "relist entries reclassified as error after restart"
        );
    }

    let events = EventBus::new();
    let gateway: Arc<dyn MarketplaceGateway> = match VintedGateway::from_env() {
        Some(gw) => Arc::new(gw),
        None => {
            warn!(
                target = "vault.api",
                "VINTED_COOKIE/VINTED_USER_ID not set; remote operations will fail until configured"
            );
            Arc::new(UnconfiguredGateway)
        }
    };
    let sync = Arc::new(SyncEngine::new(
        vault.clone(),
        gateway.clone(),
        events.clone(),
    ));
    let ontology = Arc::new(OntologyEngine::new(
        vault.clone(),
        gateway.clone(),
        events.clone(),
    ));
    let (scheduler, _worker) = RelistScheduler::spawn(
        vault.clone(),
        gateway.clone(),
        events.clone(),
        SchedulerConfig::from_env(),
    );

    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        vault,
        sync,
        ontology,
        scheduler,
        gateway,
        events,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/wardrobe", get(get_wardrobe).post(upsert_wardrobe_item))
        .route("/wardrobe/{id}", delete(delete_wardrobe_item))
        .route("/wardrobe/{id}/push", post(push_to_vinted))
        .route("/wardrobe/{id}/edit-live", post(edit_live_item))
        .route("/wardrobe/{id}/pull-live", post(pull_live_to_local))
        .route("/wardrobe/{id}/completeness", get(get_detail_completeness))
        .route("/sync/pull", post(pull_from_vinted))
        .route("/items/{remote_id}", get(get_item_detail))
        .nest(
            "/relist",
            Router::new()
                .route(
                    "/queue",
                    get(get_relist_queue)
                        .post(enqueue_relist)
                        .delete(clear_relist_queue),
                )
                .route("/queue/{id}", delete(dequeue_relist)),
        )
        .route("/ontology/{type}", get(get_ontology))
        .route("/ontology/{type}/refresh", post(refresh_ontology))
        .route("/ontology/categories/{id}/chain", get(get_category_chain))
        .route("/mutation/preview", post(preview_mutation))
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            require_bridge_auth,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/events", get(events_stream))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(37421);
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    info!(target = "vault.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    vault: Arc<Vault>,
    sync: Arc<SyncEngine>,
    ontology: Arc<OntologyEngine>,
    scheduler: RelistScheduler,
    gateway: Arc<dyn MarketplaceGateway>,
    events: EventBus,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
}

/// Stand-in gateway for a bridge started without session credentials; every
/// remote operation fails with a clear configuration error while the local
/// vault remains fully usable.
struct UnconfiguredGateway;

#[async_trait::async_trait]
impl MarketplaceGateway for UnconfiguredGateway {
    async fn fetch_listings(&self) -> Result<Vec<vinted::RemoteListing>, GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn fetch_item_detail(
        &self,
        _: i64,
    ) -> Result<vinted::RemoteItemDetail, GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn create_listing(&self, _: &vinted::ListingDraft) -> Result<i64, GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn update_listing(
        &self,
        _: i64,
        _: &vinted::ListingDraft,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn delete_listing(&self, _: i64) -> Result<(), GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn fetch_image(&self, _: &str) -> Result<Vec<u8>, GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn relist_listing(
        &self,
        _: i64,
        _: &vinted::ListingDraft,
        _: Vec<Vec<u8>>,
        _: i64,
    ) -> Result<vinted::RelistOutcome, GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
    async fn fetch_taxonomy(
        &self,
        _: OntologyType,
    ) -> Result<Vec<models::OntologyEntity>, GatewayError> {
        Err(GatewayError::NotConfigured("VINTED_COOKIE"))
    }
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "vinted-vault-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::BadRequest("unauthorized".into()));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Vinted Vault Bridge Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Push feed for the UI: queue ticks, sync progress, ontology alerts.
async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|result| {
        result
            .ok()
            .and_then(|event| SseEvent::default().json_data(&event).ok())
            .map(Ok::<_, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8 * 1024 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

// ── Wardrobe commands ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WardrobeQuery {
    #[serde(default)]
    status: Option<String>,
}

async fn get_wardrobe(
    State(state): State<AppState>,
    Query(query): Query<WardrobeQuery>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe");
    let filter = match query.status.as_deref() {
        Some(raw) => Some(
            ItemStatus::from_str(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown status `{raw}`")))?,
        ),
        None => None,
    };
    let items = state.vault.list(filter).await?;
    Ok(Json(json!({ "ok": true, "items": items })))
}

async fn upsert_wardrobe_item(
    State(state): State<AppState>,
    Json(patch): Json<ItemPatch>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe:upsert");
    let item = match patch.local_id {
        Some(local_id) => {
            let lock = state.vault.item_lock(local_id).await;
            let _guard = lock.lock().await;
            state.vault.upsert(patch).await?
        }
        None => state.vault.upsert(patch).await?,
    };
    Ok(Json(json!({ "ok": true, "item": item })))
}

async fn delete_wardrobe_item(
    State(state): State<AppState>,
    Path(local_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe:delete");
    let lock = state.vault.item_lock(local_id).await;
    let _guard = lock.lock().await;
    state.vault.delete(local_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn push_to_vinted(
    State(state): State<AppState>,
    Path(local_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe:push");
    let item = state.sync.push_item(local_id).await?;
    Ok(Json(json!({ "ok": true, "item": item })))
}

/// Trigger a reconciliation pass. The conflict check is synchronous (a
/// second concurrent run is rejected with 409); the pass itself runs in the
/// background and reports over the event stream.
async fn pull_from_vinted(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/sync/pull");
    state.sync.clone().spawn_pull()?;
    Ok(Json(json!({ "ok": true })))
}

async fn edit_live_item(
    State(state): State<AppState>,
    Path(local_id): Path<i64>,
    Json(patch): Json<ItemPatch>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe:edit-live");
    let item = state.sync.edit_live(local_id, patch).await?;
    Ok(Json(json!({ "ok": true, "item": item })))
}

async fn pull_live_to_local(
    State(state): State<AppState>,
    Path(local_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe:pull-live");
    let item = state.sync.pull_live(local_id).await?;
    Ok(Json(json!({ "ok": true, "item": item })))
}

#[derive(Debug, Deserialize)]
struct CompletenessQuery {
    #[serde(default)]
    force: bool,
}

async fn get_detail_completeness(
    State(state): State<AppState>,
    Path(local_id): Path<i64>,
    Query(query): Query<CompletenessQuery>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wardrobe:completeness");
    let report = state.sync.ensure_detail(local_id, query.force).await?;
    Ok(Json(json!({
        "ok": true,
        "complete": report.complete,
        "hydrated": report.hydrated,
        "detail_hydrated_at": report.detail_hydrated_at,
    })))
}

async fn get_item_detail(
    State(state): State<AppState>,
    Path(remote_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/items:detail");
    let detail = state.gateway.fetch_item_detail(remote_id).await?;
    Ok(Json(json!({ "ok": true, "data": detail })))
}

// ── Relist queue commands ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    local_ids: Vec<i64>,
}

async fn enqueue_relist(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/relist:enqueue");
    let added = state.scheduler.enqueue(&request.local_ids).await?;
    Ok(Json(json!({ "ok": true, "added": added })))
}

async fn dequeue_relist(
    State(state): State<AppState>,
    Path(local_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/relist:dequeue");
    state.scheduler.dequeue(local_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn clear_relist_queue(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/relist:clear");
    let removed = state.scheduler.clear().await?;
    Ok(Json(json!({ "ok": true, "removed": removed })))
}

async fn get_relist_queue(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/relist:queue");
    let snapshot = state.scheduler.snapshot().await?;
    Ok(Json(json!({
        "ok": true,
        "queue": snapshot.queue,
        "countdown": snapshot.countdown,
        "processing": snapshot.processing,
    })))
}

// ── Ontology commands ───────────────────────────────────────────────────

fn parse_ontology_type(raw: &str) -> Result<OntologyType, AppError> {
    OntologyType::from_str(raw)
        .ok_or_else(|| AppError::BadRequest(format!("unknown ontology type `{raw}`")))
}

async fn get_ontology(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/ontology:get");
    let kind = parse_ontology_type(&kind)?;
    let entities = state.ontology.entities(kind).await?;
    let fetched_at = state.vault.ontology_fetched_at(kind).await?;
    Ok(Json(json!({
        "ok": true,
        "entities": entities,
        "fetched_at": fetched_at,
    })))
}

async fn refresh_ontology(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/ontology:refresh");
    let kind = parse_ontology_type(&kind)?;
    let alert = state.ontology.refresh(kind).await?;
    Ok(Json(json!({ "ok": true, "alert": alert })))
}

async fn get_category_chain(
    State(state): State<AppState>,
    Path(category_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/ontology:chain");
    let chain = state.ontology.category_chain(category_id).await?;
    let leaf = state.ontology.validate_leaf(category_id).await.is_ok();
    Ok(Json(json!({ "ok": true, "chain": chain, "leaf": leaf })))
}

// ── Mutation preview ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MutationPreviewRequest {
    image_b64: String,
    #[serde(default)]
    relist_count: i64,
}

/// Apply the image mutation without uploading anything; used by the UI to
/// preview the exact thumbnail a relist would submit.
async fn preview_mutation(
    Json(request): Json<MutationPreviewRequest>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/mutation:preview");
    let bytes = BASE64
        .decode(request.image_b64.as_bytes())
        .map_err(|err| AppError::BadRequest(format!("invalid base64: {err}")))?;
    let mutated = mutate::mutate_image(&bytes, request.relist_count)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    Ok(Json(json!({ "ok": true, "image_b64": BASE64.encode(mutated) })))
}

// ── Error mapping ───────────────────────────────────────────────────────

#[derive(Debug)]
enum AppError {
    Vault(VaultError),
    Sync(SyncError),
    Ontology(OntologyError),
    Gateway(GatewayError),
    BadRequest(String),
}

impl From<VaultError> for AppError {
    fn from(value: VaultError) -> Self {
        Self::Vault(value)
    }
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

impl From<OntologyError> for AppError {
    fn from(value: OntologyError) -> Self {
        Self::Ontology(value)
    }
}

impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

fn gateway_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::SessionExpired => StatusCode::UNAUTHORIZED,
        GatewayError::Forbidden | GatewayError::Challenge => StatusCode::FORBIDDEN,
        GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn vault_status(err: &VaultError) -> StatusCode {
    match err {
        VaultError::NotFound(_) => StatusCode::NOT_FOUND,
        VaultError::Conflict(_) | VaultError::DuplicateRemote(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Vault(err) => (vault_status(err), "vault"),
            AppError::Sync(SyncError::Busy) => (StatusCode::CONFLICT, "sync"),
            AppError::Sync(SyncError::Validation(_)) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Sync(SyncError::Vault(err)) => (vault_status(err), "vault"),
            AppError::Sync(SyncError::Gateway(err)) => (gateway_status(err), "gateway"),
            AppError::Ontology(OntologyError::UnknownCategory(_)) => {
                (StatusCode::NOT_FOUND, "ontology")
            }
            AppError::Ontology(OntologyError::NotLeaf(_)) => {
                (StatusCode::BAD_REQUEST, "ontology")
            }
            AppError::Ontology(OntologyError::Vault(err)) => (vault_status(err), "vault"),
            AppError::Ontology(OntologyError::Gateway(err)) => (gateway_status(err), "gateway"),
            AppError::Ontology(OntologyError::BrokenChain(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ontology")
            }
            AppError::Gateway(err) => (gateway_status(err), "gateway"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::Vault(err) => err.to_string(),
            AppError::Sync(err) => err.to_string(),
            AppError::Ontology(err) => err.to_string(),
            AppError::Gateway(err) => err.to_string(),
            AppError::BadRequest(message) => message.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let payload = json!({
            "ok": false,
            "error": code,
            "detail": self.detail(),
        });
        (status, Json(payload)).into_response()
    }
}
