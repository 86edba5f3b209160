use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;

use super::upstream::{is_hop_by_hop_header, ByteStream};
use super::ProxyOptions;

pub const X_PROXY: HeaderName = HeaderName::from_static("x-proxy");
pub const X_PROXY_REWRITTEN: HeaderName = HeaderName::from_static("x-proxy-rewritten");

/// Copy upstream response headers for the visitor, without hop-by-hop
/// headers and, when requested, without cookies.
pub fn forwarded_headers(upstream: &HeaderMap, options: ProxyOptions) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 2);
    for (name, value) in upstream.iter() {
        if is_hop_by_hop_header(name) {
            continue;
        }
        if options.remove_cookies && *name == header::SET_COOKIE {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Emit a rewritten text body as a single buffer.
pub fn emit_rewritten(
    status: StatusCode,
    mut headers: HeaderMap,
    body: Vec<u8>,
    content_type: &str,
) -> Response {
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }

    build(status, headers, Body::from(body), true)
}

/// Emit an already buffered body exactly as received.
pub fn emit_buffered(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    build(status, headers, Body::from(body), false)
}

/// Emit a body by streaming it from upstream without buffering.
pub fn emit_streaming(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Response {
    build(status, headers, Body::from_stream(body), false)
}

fn build(status: StatusCode, mut headers: HeaderMap, body: Body, rewritten: bool) -> Response {
    headers.insert(X_PROXY, HeaderValue::from_static("browsing-proxy"));
    headers.insert(
        X_PROXY_REWRITTEN,
        HeaderValue::from_static(if rewritten { "true" } else { "false" }),
    );

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
