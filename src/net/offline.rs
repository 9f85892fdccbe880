//! Synthetic responses served when neither the network nor a cache tier can answer.

use serde_json::json;

use super::types::Response;

const OFFLINE_HTML: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>This page is not available offline. It will load again once the connection is restored.</p>\
</body></html>";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"200\" viewBox=\"0 0 200 200\">\
<rect width=\"200\" height=\"200\" fill=\"#e5e7eb\"/>\
<text x=\"100\" y=\"105\" font-family=\"sans-serif\" font-size=\"14\" text-anchor=\"middle\" fill=\"#6b7280\">Offline</text>\
</svg>";

/// Offline page for static and dynamic requests.
pub fn offline_page() -> Response {
  Response::new(503, OFFLINE_HTML).with_header("Content-Type", "text/html; charset=utf-8")
}

/// Placeholder for images that are neither cached nor reachable.
pub fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_SVG)
    .with_header("Content-Type", "image/svg+xml")
    .with_header("Cache-Control", "no-store")
}

/// API fallback when the network failed and no valid cached response exists.
pub fn api_offline(message: &str) -> Response {
  json_response(
    503,
    json!({
      "error": "Offline",
      "message": message,
      "queued": true,
    }),
  )
}

/// Optimistic acknowledgement for a mutation that was queued for replay.
pub fn queued_ack(message: &str) -> Response {
  json_response(
    202,
    json!({
      "success": true,
      "queued": true,
      "message": message,
    }),
  )
}

fn json_response(status: u16, body: serde_json::Value) -> Response {
  Response::new(status, body.to_string()).with_header("Content-Type", "application/json")
}
