//! Per-request session identification
//!
//! Network transports carry an `Mcp-Session-Id` header that rmcp
//! preserves in request extensions; stdio serves exactly one client, so a
//! fixed key is enough there.

use rmcp::model::Extensions;

/// Session key for the single stdio client
pub const STDIO_SESSION: &str = "stdio";

/// Session key for the request, falling back to the stdio key when no
/// HTTP parts are present.
pub fn session_key(extensions: &Extensions) -> String {
    extensions
        .get::<http::request::Parts>()
        .and_then(|parts| {
            parts
                .headers
                .get("mcp-session-id")
                .or_else(|| parts.headers.get("Mcp-Session-Id"))
        })
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| STDIO_SESSION.to_string())
}
