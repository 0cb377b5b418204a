//! Headers the edge synthesizes itself: CORS, cache status and proxy identity.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

const ALLOW_ORIGIN: HeaderValue = HeaderValue::from_static("*");
const ALLOW_METHODS: HeaderValue = HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS");
const ALLOW_HEADERS: HeaderValue = HeaderValue::from_static("Content-Type, Authorization");
const MAX_AGE: HeaderValue = HeaderValue::from_static("86400");

const CACHE_HIT: HeaderValue = HeaderValue::from_static("HIT");
const CACHE_MISS: HeaderValue = HeaderValue::from_static("MISS");

fn insert_allow_all(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN);
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS);
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS);
}

/// Terminal answer to any `OPTIONS` request.
pub fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    insert_allow_all(headers);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, MAX_AGE);
    response
}

/// Response for a body found in the cache store.
pub fn cache_hit_response(body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_CACHE, CACHE_HIT);
    insert_allow_all(headers);
    response
}

/// Overrides applied to every response that came from origin.
pub fn apply_forwarded_overrides(headers: &mut HeaderMap, powered_by: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN);
    headers.insert(X_CACHE, CACHE_MISS);
    headers.insert(X_POWERED_BY, powered_by.clone());
}
