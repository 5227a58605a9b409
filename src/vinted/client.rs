use crate::http::build_client;
use crate::models::{OntologyEntity, OntologyType};
use crate::vinted::config::{BASE_URL, PACE_BASE_MS, PACE_JITTER_MS, SEC_CH_UA, USER_AGENT};
use crate::vinted::{
    GatewayError, ListingDraft, MarketplaceGateway, RelistOutcome, RemoteItemDetail, RemoteListing,
    items, taxonomy, wardrobe,
};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Authenticated browser session lifted from the user's logged-in browser.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie: String,
    pub csrf_token: Option<String>,
    pub anon_id: Option<String>,
    pub user_id: i64,
    pub per_page: usize,
}

impl SessionConfig {
    pub fn from_env() -> Option<Self> {
        let cookie = std::env::var("VINTED_COOKIE").ok()?;
        let user_id = std::env::var("VINTED_USER_ID").ok()?.parse().ok()?;
        Some(Self {
            cookie,
            csrf_token: std::env::var("VINTED_CSRF_TOKEN").ok(),
            anon_id: std::env::var("VINTED_ANON_ID").ok(),
            user_id,
            per_page: std::env::var("WARDROBE_PER_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(20),
        })
    }
}

/// Production marketplace gateway. One shared HTTP client so TLS
/// connections are reused across calls instead of a fresh handshake per
/// request (a detectable pattern).
pub struct VintedGateway {
    pub(crate) http: Client,
    pub(crate) session: SessionConfig,
}

impl VintedGateway {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            http: build_client(),
            session,
        }
    }

    pub fn from_env() -> Option<Self> {
        SessionConfig::from_env().map(Self::new)
    }

    pub(crate) fn read_headers(&self, referer: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, "Accept", "application/json, text/plain, */*");
        insert(&mut headers, "Accept-Language", "en-GB,en;q=0.9");
        insert(&mut headers, "Origin", &BASE_URL);
        insert(&mut headers, "Referer", referer);
        insert(&mut headers, "Sec-Ch-Ua", &SEC_CH_UA);
        insert(&mut headers, "Sec-Ch-Ua-Mobile", "?0");
        insert(&mut headers, "Sec-Ch-Ua-Platform", "\"macOS\"");
        insert(&mut headers, "Sec-Fetch-Dest", "empty");
        insert(&mut headers, "Sec-Fetch-Mode", "cors");
        insert(&mut headers, "Sec-Fetch-Site", "same-origin");
        insert(&mut headers, "User-Agent", &USER_AGENT);
        insert(&mut headers, "Cookie", &self.session.cookie);
        headers
    }

    pub(crate) fn write_headers(&self, referer: &str, upload_form: bool) -> HeaderMap {
        let mut headers = self.read_headers(referer);
        insert(&mut headers, "Content-Type", "application/json");
        if let Some(token) = &self.session.csrf_token {
            insert(&mut headers, "x-csrf-token", token);
        }
        if let Some(anon) = &self.session.anon_id {
            insert(&mut headers, "x-anon-id", anon);
        }
        if upload_form {
            insert(&mut headers, "x-upload-form", "true");
        }
        headers
    }

    /// Per-request delay: base interval plus random jitter, so outbound
    /// calls never land on a fixed cadence.
    pub(crate) async fn pace(&self) {
        let base = *PACE_BASE_MS;
        let jitter = *PACE_JITTER_MS;
        if base == 0 {
            return;
        }
        let delay = {
            let mut rng = rand::rng();
            base + rng.random_range(0..=jitter)
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    pub(crate) fn classify_status(status: StatusCode) -> Option<GatewayError> {
        match status.as_u16() {
            401 => Some(GatewayError::SessionExpired),
            403 => Some(GatewayError::Forbidden),
            429 => Some(GatewayError::RateLimited),
            _ => None,
        }
    }

    /// A JSON endpoint answering with an HTML document is a bot challenge
    /// page slipping through with HTTP 200, not data.
    pub(crate) fn detect_challenge(
        content_type: Option<&str>,
        body: &str,
    ) -> Result<(), GatewayError> {
        if let Some(ct) = content_type
            && ct.contains("text/html")
        {
            let head: String = body.chars().take(500).collect::<String>().to_lowercase();
            if head.contains("datadome") || head.contains("<!doctype") || head.contains("<html") {
                return Err(GatewayError::Challenge);
            }
        }
        Ok(())
    }

    /// Shared terminal handling for JSON endpoints: classify the status,
    /// screen for challenge pages, parse the body.
    pub(crate) async fn read_json(
        response: Response,
        allow: &[u16],
    ) -> Result<Value, GatewayError> {
        let status = response.status();
        if let Some(err) = Self::classify_status(status) {
            return Err(err);
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = response
            .text()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        if !allow.contains(&status.as_u16()) {
            let head: String = body.chars().take(300).collect();
            return Err(GatewayError::Request(format!("HTTP {status}: {head}")));
        }
        Self::detect_challenge(content_type.as_deref(), &body)?;
        serde_json::from_str(&body).map_err(|err| GatewayError::Parse(format!("invalid JSON: {err}")))
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(parsed) => {
            headers.insert(name, parsed);
        }
        Err(_) => warn!(target = "vault.gateway", header = name, "skipped invalid header value"),
    }
}

#[async_trait]
impl MarketplaceGateway for VintedGateway {
    async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, GatewayError> {
        wardrobe::fetch_all(self).await
    }

    async fn fetch_item_detail(&self, remote_id: i64) -> Result<RemoteItemDetail, GatewayError> {
        items::fetch_item_detail(self, remote_id).await
    }

    async fn create_listing(&self, draft: &ListingDraft) -> Result<i64, GatewayError> {
        items::create_listing(self, draft, None).await
    }

    async fn update_listing(
        &self,
        remote_id: i64,
        draft: &ListingDraft,
    ) -> Result<(), GatewayError> {
        items::update_listing(self, remote_id, draft).await
    }

    async fn delete_listing(&self, remote_id: i64) -> Result<(), GatewayError> {
        items::delete_listing(self, remote_id).await
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Request(format!(
                "HTTP {} fetching image",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn relist_listing(
        &self,
        old_remote_id: i64,
        draft: &ListingDraft,
        images: Vec<Vec<u8>>,
        relist_count: i64,
    ) -> Result<RelistOutcome, GatewayError> {
        items::relist_item(self, old_remote_id, draft, images, relist_count).await
    }

    async fn fetch_taxonomy(
        &self,
        kind: OntologyType,
    ) -> Result<Vec<OntologyEntity>, GatewayError> {
        taxonomy::fetch(self, kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_detection_flags_html_on_json_route() {
        let err = VintedGateway::detect_challenge(
            Some("text/html; charset=utf-8"),
            "<!DOCTYPE html><html><body>checking your browser</body></html>",
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Challenge));
    }

    #[test]
    fn challenge_detection_passes_json() {
        VintedGateway::detect_challenge(Some("application/json"), "{\"items\":[]}").unwrap();
        VintedGateway::detect_challenge(None, "{}").unwrap();
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            VintedGateway::classify_status(StatusCode::UNAUTHORIZED),
            Some(GatewayError::SessionExpired)
        ));
        assert!(matches!(
            VintedGateway::classify_status(StatusCode::FORBIDDEN),
            Some(GatewayError::Forbidden)
        ));
        assert!(matches!(
            VintedGateway::classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(GatewayError::RateLimited)
        ));
        assert!(VintedGateway::classify_status(StatusCode::OK).is_none());
    }
}
