use async_trait::async_trait;
use reqwest::header::{HeaderName, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Request, Response, StatusCode};
use std::time::Instant;

use crate::config::DebugMode;
use crate::error::{RelayError, Result};
use crate::transport::{redact, Transport};

/// Network logger wrapping the outgoing transport
///
/// Supports three modes:
/// - off: only 401 responses are logged
/// - errors: responses >= 400 and transport errors
/// - all: every request and response
pub struct NetworkLogger<T> {
    inner: T,
    mode: DebugMode,
}

impl<T: Transport> NetworkLogger<T> {
    pub fn new(inner: T, mode: DebugMode) -> Self {
        Self { inner, mode }
    }

    pub fn mode(&self) -> DebugMode {
        self.mode
    }
}

#[async_trait]
impl<T: Transport> Transport for NetworkLogger<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        let method = request.method().clone();
        let url = request.url().clone();
        let auth = request
            .headers()
            .get(AUTHORIZATION)
            .map(|v| auth_preview(v.to_str().unwrap_or("<binary>")));

        if self.mode == DebugMode::All {
            tracing::info!(
                method = %method,
                url = %url,
                has_auth = auth.is_some(),
                auth = auth.as_deref().unwrap_or("-"),
                "[Network] Request"
            );
        }

        let started = Instant::now();
        let result = self.inner.send(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                let status = response.status();
                let header = |name: HeaderName| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string()
                };

                if status == StatusCode::UNAUTHORIZED {
                    tracing::warn!(
                        method = %method,
                        url = %url,
                        had_auth = auth.is_some(),
                        auth = auth.as_deref().unwrap_or("-"),
                        www_authenticate = %header(WWW_AUTHENTICATE),
                        elapsed_ms,
                        "[Network] 401 Unauthorized"
                    );
                } else if should_log(self.mode, status) {
                    tracing::info!(
                        method = %method,
                        url = %url,
                        status = status.as_u16(),
                        content_type = %header(CONTENT_TYPE),
                        elapsed_ms,
                        "[Network] Response"
                    );
                }
            }
            Err(e) => {
                if self.mode != DebugMode::Off {
                    tracing::error!(
                        method = %method,
                        url = %url,
                        error_kind = error_kind(e),
                        error = %e,
                        elapsed_ms,
                        "[Network] Request failed"
                    );
                }
            }
        }

        result
    }
}

/// Whether a non-401 response is worth logging in this mode
fn should_log(mode: DebugMode, status: StatusCode) -> bool {
    match mode {
        DebugMode::Off => false,
        DebugMode::Errors => status.is_client_error() || status.is_server_error(),
        DebugMode::All => true,
    }
}

/// `Bearer eyJhbGciOiJI...` style preview of an Authorization value
fn auth_preview(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, credentials)) => format!("{} {}", scheme, redact(credentials)),
        None => redact(value),
    }
}

/// Categorize a transport error for logs
fn error_kind(error: &RelayError) -> &'static str {
    match error {
        RelayError::Network(e) if e.is_timeout() => "timeout",
        RelayError::Network(e) if e.is_connect() => "connection_failed",
        RelayError::Network(e) if e.is_request() => "request_error",
        RelayError::Network(e) if e.is_body() => "body_error",
        RelayError::Network(e) if e.is_decode() => "decode_error",
        other => other.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedTransport, BASE_URL};
    use reqwest::{Method, Url};
    use std::sync::Arc;

    #[test]
    fn test_should_log() {
        assert!(!should_log(DebugMode::Off, StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_log(DebugMode::Errors, StatusCode::OK));
        assert!(should_log(DebugMode::Errors, StatusCode::NOT_FOUND));
        assert!(should_log(DebugMode::Errors, StatusCode::BAD_GATEWAY));
        assert!(should_log(DebugMode::All, StatusCode::OK));
    }

    #[test]
    fn test_auth_preview_redacts() {
        assert_eq!(
            auth_preview("Bearer eyJhbGciOiJIUzI1NiJ9.payload.sig"),
            "Bearer eyJhbGciOiJI..."
        );
        assert_eq!(auth_preview("Bearer A1"), "Bearer A1");
        assert_eq!(auth_preview("opaque-secret-value"), "opaque-secre...");
    }

    #[tokio::test]
    async fn test_logger_is_transparent() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            "/missing" => Reply::status(404),
            _ => Reply::status(401),
        });
        let logger = NetworkLogger::new(transport.clone(), DebugMode::All);
        let base = Url::parse(BASE_URL).unwrap();

        let response = logger
            .send(Request::new(Method::GET, base.join("/missing").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = logger
            .send(Request::new(Method::GET, base.join("/api/data").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_logger_passes_errors_through() {
        let logger = NetworkLogger::new(Arc::new(reqwest::Client::new()), DebugMode::Errors);
        let request = Request::new(
            Method::GET,
            Url::parse("http://127.0.0.1:1/api/data").unwrap(),
        );

        let err = logger.send(request).await.unwrap_err();
        assert!(matches!(err, RelayError::Network(_)));
        assert_eq!(error_kind(&err), "connection_failed");
    }
}
