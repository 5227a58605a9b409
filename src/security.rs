use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, env, sync::Arc};
use tracing::info;

/// Shared-key auth for the bridge port. The bridge binds to loopback for a
/// local UI, so running without a key is the default; setting
/// `VAULT_BRIDGE_KEY` locks every business route behind it.
#[derive(Clone)]
pub struct AuthState {
    key: Option<Arc<String>>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let key = env::var("VAULT_BRIDGE_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(Arc::new);
        if key.is_some() {
            info!(target = "vault.api", "bridge key auth enabled");
        }
        Self { key }
    }

    fn accepts(&self, presented: Option<&str>) -> bool {
        match &self.key {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }
}

pub async fn require_bridge_auth(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let presented = extract_bridge_key(request.headers());
    if !state.accepts(presented.as_deref()) {
        return Ok(unauthorized_response(
            "invalid_bridge_key",
            "Provide X-Vault-Key or Bearer token",
        ));
    }
    Ok(next.run(request).await)
}

fn extract_bridge_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Vault-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_when_no_key_configured() {
        let state = AuthState { key: None };
        assert!(state.accepts(None));
        assert!(state.accepts(Some("anything")));
    }

    #[test]
    fn locked_when_key_configured() {
        let state = AuthState {
            key: Some(Arc::new("secret".to_string())),
        };
        assert!(state.accepts(Some("secret")));
        assert!(!state.accepts(Some("wrong")));
        assert!(!state.accepts(None));
    }

    #[test]
    fn bearer_and_header_extraction() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer  secret ".parse().unwrap(),
        );
        assert_eq!(extract_bridge_key(&headers).as_deref(), Some("secret"));

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Vault-Key", "other".parse().unwrap());
        assert_eq!(extract_bridge_key(&headers).as_deref(), Some("other"));

        assert_eq!(extract_bridge_key(&http::HeaderMap::new()), None);
    }
}
