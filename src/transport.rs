// Transport abstraction
// The minimal `send(request) -> response` capability every auth decorator wraps

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Request, Response, Url};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Anything that can carry a request to a server and hand back its response
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl Transport for Client {
    async fn send(&self, request: Request) -> Result<Response> {
        Ok(self.execute(request).await?)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        (**self).send(request).await
    }
}

/// Create the shared HTTP client with connection pooling
///
/// `include_credentials` enables a cookie jar so session cookies travel with
/// intercepted requests the same way a browser's `credentials: include` does.
pub fn build_client(
    max_connections: usize,
    connect_timeout: u64,
    request_timeout: u64,
    include_credentials: bool,
) -> anyhow::Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(max_connections)
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .cookie_store(include_credentials)
        .build()
        .context("Failed to create HTTP client")
}

/// Build a request with a JSON body
pub fn json_request<T: Serialize + ?Sized>(method: Method, url: Url, body: &T) -> Result<Request> {
    let bytes = serde_json::to_vec(body)
        .map_err(|e| RelayError::Internal(anyhow::anyhow!("Failed to encode body: {}", e)))?;

    let mut request = Request::new(method, url);
    request
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    *request.body_mut() = Some(bytes.into());
    Ok(request)
}

/// `Authorization: Bearer <token>` header value, marked sensitive
pub fn bearer_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| RelayError::Validation("access token is not a valid header value".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Shorten a secret for log output
pub fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(12).collect();
    if visible.len() < secret.len() {
        format!("{}...", visible)
    } else {
        visible
    }
}
