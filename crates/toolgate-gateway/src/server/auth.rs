//! Network transport protection
//!
//! Two independent checks guard the protocol route (never `/health`):
//!
//! - **Origin validation**: browser requests carrying an Origin header
//!   must come from localhost. Anything else is a DNS-rebinding attempt
//!   as far as the gateway is concerned and gets a 403. Requests without
//!   an Origin (non-browser clients) pass unconditionally.
//! - **Bearer authentication**: outside container mode, every request
//!   must carry the gateway's bearer token; missing or wrong tokens get
//!   a 401 on that request only.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use base64::Engine;
use rand::RngCore;
use tracing::{debug, warn};
use url::Url;

/// Per-transport guard configuration shared with the axum middleware
pub struct TransportGuard {
    /// `None` disables bearer auth (container mode)
    pub token: Option<String>,
}

/// Generate a fresh bearer token.
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Read the token from `path`, or generate one and persist it there.
pub fn load_or_generate_token(path: &Path) -> anyhow::Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let token = generate_auth_token();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;
    Ok(token)
}

/// Whether a request with this Origin header may proceed.
///
/// Absent Origin means a non-browser client: pass. Present Origin must
/// be an http(s) URL whose host is localhost, 127.0.0.1, or ::1.
pub fn origin_allowed(origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };

    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("::1") | Some("[::1]"))
}

/// Axum middleware applying Origin validation and bearer authentication.
pub async fn transport_guard_middleware(
    axum::extract::State(guard): axum::extract::State<Arc<TransportGuard>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    // CORS preflights never carry a bearer token
    if request.method() == axum::http::Method::OPTIONS {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok());
    if !origin_allowed(origin) {
        warn!(origin = origin.unwrap_or("-"), "Rejecting non-localhost browser origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    if let Some(expected) = &guard.token {
        let presented = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if token == expected => {}
            Some(_) => {
                warn!("Rejecting request with invalid bearer token");
                return unauthorized_response("Invalid token");
            }
            None => {
                debug!("Rejecting request without bearer token");
                return unauthorized_response("Missing bearer token");
            }
        }
    }

    next.run(request).await
}

fn unauthorized_response(message: &str) -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [(
            "WWW-Authenticate",
            r#"Bearer realm="ToolGate Gateway", error="invalid_token""#,
        )],
        message.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_origin_passes() {
        assert!(origin_allowed(None));
    }

    #[test]
    fn test_localhost_origins_pass() {
        assert!(origin_allowed(Some("http://localhost:8811")));
        assert!(origin_allowed(Some("http://localhost")));
        assert!(origin_allowed(Some("https://localhost:3000")));
        assert!(origin_allowed(Some("http://127.0.0.1:8811")));
    }

    #[test]
    fn test_foreign_origins_rejected() {
        assert!(!origin_allowed(Some("http://evil.example.com")));
        assert!(!origin_allowed(Some("https://localhost.evil.example.com")));
        assert!(!origin_allowed(Some("http://192.168.1.10:8811")));
    }

    #[test]
    fn test_garbage_origins_rejected() {
        assert!(!origin_allowed(Some("not a url")));
        assert!(!origin_allowed(Some("file:///etc/passwd")));
        assert!(!origin_allowed(Some("chrome-extension://abcdef")));
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = generate_auth_token();
        let b = generate_auth_token();
        assert_ne!(a, b);
        assert!(a.len() >= 40, "32 random bytes base64-encoded");
    }

    #[test]
    fn test_load_or_generate_roundtrip() {
        let dir = std::env::temp_dir().join(format!("toolgate-test-{}", std::process::id()));
        let path = dir.join("auth_token");

        let first = load_or_generate_token(&path).unwrap();
        let second = load_or_generate_token(&path).unwrap();
        assert_eq!(first, second, "persisted token is reused");

        std::fs::remove_dir_all(&dir).ok();
    }
}
