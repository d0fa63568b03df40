// Event-style requests
// open / set header / send with load listeners, sharing the executor's 401 handling

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Request, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::InterceptionLayer;
use crate::error::{RelayError, Result};
use crate::transport::{bearer_header, redact};

type LoadListener = Box<dyn Fn(&Completion) + Send + Sync>;

/// Who put the Authorization header on the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthHeader {
    Absent,
    Injected,
    Caller,
}

/// Fully buffered response handed to load listeners
#[derive(Debug, Clone)]
pub struct Completion {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Completion {
    async fn read(response: Response) -> Result<Self> {
        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(Self {
            url,
            status,
            headers,
            body,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RelayError::Internal(anyhow::anyhow!("Malformed response body: {}", e)))
    }
}

/// A request built step by step, for callers that work with events rather than futures
pub struct EventRequest {
    layer: Arc<InterceptionLayer>,
    method: Option<Method>,
    url: Option<Url>,
    headers: HeaderMap,
    auth: AuthHeader,
    with_credentials: bool,
    listeners: Vec<LoadListener>,
}

impl EventRequest {
    pub(crate) fn new(layer: Arc<InterceptionLayer>) -> Self {
        Self {
            layer,
            method: None,
            url: None,
            headers: HeaderMap::new(),
            auth: AuthHeader::Absent,
            with_credentials: false,
            listeners: Vec::new(),
        }
    }

    /// Record method and target; resets any headers set before
    pub fn open(&mut self, method: Method, url: &str) -> Result<()> {
        let url = Url::parse(url)
            .map_err(|e| RelayError::Validation(format!("Invalid request URL {}: {}", url, e)))?;

        self.method = Some(method);
        self.url = Some(url);
        self.headers.clear();
        self.auth = AuthHeader::Absent;
        Ok(())
    }

    fn intercepted(&self) -> bool {
        self.url
            .as_ref()
            .is_some_and(|url| self.layer.matcher().matches(url))
    }

    /// Add a caller header; protected requests get the bearer token alongside
    pub async fn set_request_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RelayError::Validation(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RelayError::Validation(format!("Invalid header value: {}", e)))?;

        if name == AUTHORIZATION {
            self.headers.insert(AUTHORIZATION, value);
            self.auth = AuthHeader::Caller;
            return Ok(());
        }

        self.headers.append(name, value);

        if self.auth == AuthHeader::Absent && self.intercepted() {
            if let Some(token) = self.layer.executor().access_token().await {
                tracing::debug!(token = %redact(&token), "Injecting Authorization header");
                self.headers.insert(AUTHORIZATION, bearer_header(&token)?);
                self.auth = AuthHeader::Injected;
            }
        }

        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the request was marked as carrying credentials
    ///
    /// Reporting only: intercepted sends set it, but cookies come from the
    /// client-wide jar (`INCLUDE_CREDENTIALS`) for every request alike.
    pub fn with_credentials(&self) -> bool {
        self.with_credentials
    }

    pub fn set_with_credentials(&mut self, enabled: bool) {
        self.with_credentials = enabled;
    }

    /// Register a callback run once the response is fully read
    pub fn add_load_listener(&mut self, listener: impl Fn(&Completion) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Send the request and notify load listeners
    pub async fn send(&mut self, body: Option<Bytes>) -> Result<Completion> {
        let (Some(method), Some(url)) = (self.method.clone(), self.url.clone()) else {
            return Err(RelayError::Validation(
                "send called before open".to_string(),
            ));
        };

        let intercepted = self.intercepted();
        let mut headers = self.headers.clone();
        if intercepted {
            self.with_credentials = true;
            // The executor attaches the freshest token right before sending
            if self.auth == AuthHeader::Injected {
                headers.remove(AUTHORIZATION);
            }
        }

        let mut request = Request::new(method, url.clone());
        *request.headers_mut() = headers;
        if let Some(body) = body {
            *request.body_mut() = Some(body.into());
        }

        let response = if intercepted {
            self.layer.executor().execute(request).await?
        } else {
            self.layer.original().send(request).await?
        };

        let completion = Completion::read(response).await?;
        if intercepted && completion.status == StatusCode::UNAUTHORIZED {
            tracing::warn!(
                url = %url,
                caller_managed = self.auth == AuthHeader::Caller,
                "Request finished unauthorized"
            );
        }

        for listener in &self.listeners {
            listener(&completion);
        }

        Ok(completion)
    }
}
