// Authentication, CORS, request id, and network debug logging middleware

pub mod debug;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::error::RelayError;
use crate::routes::AppState;

pub use debug::NetworkLogger;

/// Alternative header carrying the relay API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Authentication middleware
///
/// Accepts the relay key as `Authorization: Bearer {RELAY_API_KEY}` or in
/// `x-api-key`. The matching header is removed so the key never reaches the
/// upstream and the stored session token can take its place.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, RelayError> {
    let key = state.relay_api_key.as_str();
    let expected = format!("Bearer {}", key);
    let headers = request.headers_mut();
    let mut authorized = false;

    if !key.is_empty() {
        if headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
        {
            headers.remove(header::AUTHORIZATION);
            authorized = true;
        }

        if headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == key)
        {
            headers.remove(API_KEY_HEADER);
            authorized = true;
        }
    }

    if authorized {
        return Ok(next.run(request).await);
    }

    tracing::warn!(
        method = %request.method(),
        path = %request.uri().path(),
        "Access attempt with invalid or missing API key"
    );
    Err(RelayError::Authentication(
        "Invalid or missing API key".to_string(),
    ))
}

/// Header carrying the per-request id on gateway responses
pub const REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Tag every gateway request with a short id and log its outcome
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let started = Instant::now();
    let mut response = next.run(request).await;
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if response.status().is_server_error() {
        tracing::warn!(request_id = %request_id, %method, %path, status, elapsed_ms, "Request failed");
    } else {
        tracing::debug!(request_id = %request_id, %method, %path, status, elapsed_ms, "Request completed");
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Request id available to handlers as an extension
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Create CORS middleware layer
///
/// Configures CORS to allow all origins, methods, and headers.
/// Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
