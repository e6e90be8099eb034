//! Synthesized HTTP responses.
//!
//! The proxied protocol is HTTP, so a session that cannot reach the backend
//! answers the client itself. Exact bytes matter to client parsers.

use serde_json::json;

/// Build the `503 Service Unavailable` response sent when a session fails.
pub fn service_unavailable(reason: &str) -> Vec<u8> {
    let body = json!({ "error": reason }).to_string();
    let mut response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: application/json\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}
