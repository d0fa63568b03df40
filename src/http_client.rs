use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Request, Response, StatusCode};
use std::sync::Arc;

use crate::auth::{CredentialStore, RefreshCoordinator};
use crate::error::Result;
use crate::transport::{bearer_header, Transport};

/// Sends requests with the current access token attached
///
/// Handles a 401 by refreshing the token (single-flight) and retrying the
/// request exactly once. Network failures are never retried here.
pub struct AuthenticatedExecutor {
    /// Underlying transport (the original, non-intercepted one)
    transport: Arc<dyn Transport>,

    /// Credential pair, read fresh for every attempt
    credentials: Arc<CredentialStore>,

    /// Shared refresh coordinator
    refresher: Arc<RefreshCoordinator>,
}

impl AuthenticatedExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            credentials,
            refresher,
        }
    }

    /// Current access token, if signed in
    pub async fn access_token(&self) -> Option<String> {
        self.credentials.get().await.access_token
    }

    /// Execute a request, refreshing and retrying once on 401
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_with(request, false).await
    }

    /// Execute a request; `already_retried` disables the refresh-and-retry step
    pub async fn execute_with(&self, mut request: Request, already_retried: bool) -> Result<Response> {
        // A caller that sets its own Authorization owns it: no attach, no retry
        let caller_managed = request.headers().contains_key(AUTHORIZATION);
        let sent_token = if caller_managed {
            None
        } else {
            let token = self.access_token().await;
            if let Some(token) = token.as_deref() {
                request
                    .headers_mut()
                    .insert(AUTHORIZATION, bearer_header(token)?);
            }
            token
        };

        let method = request.method().clone();
        let url = request.url().clone();
        let replay = if already_retried || caller_managed {
            None
        } else {
            request.try_clone()
        };

        tracing::debug!(
            method = %method,
            url = %url,
            authenticated = sent_token.is_some(),
            caller_managed,
            "Sending HTTP request"
        );

        let response = self.send_logged(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if already_retried {
            tracing::warn!(url = %url, "Still unauthorized after token refresh");
            return Ok(response);
        }
        if caller_managed {
            tracing::debug!(url = %url, "401 on caller-managed Authorization, not retrying");
            return Ok(response);
        }

        let current = self.credentials.get().await;
        if current.refresh_token.is_none() {
            // The coordinator signs out without touching the network
            tracing::warn!(url = %url, "401 without refresh token, signing out");
            self.refresher.refresh().await;
            return Ok(response);
        }

        let Some(mut retry) = replay else {
            tracing::warn!(url = %url, "401 on request with a streaming body, not retrying");
            return Ok(response);
        };

        let token = match current.access_token {
            Some(current) if sent_token.as_deref() != Some(current.as_str()) => {
                tracing::debug!(url = %url, "Access token changed while request was in flight");
                current
            }
            _ => {
                tracing::warn!(url = %url, "Received 401, refreshing token and retrying...");
                match self.refresher.refresh().await {
                    Some(token) => token,
                    None => {
                        tracing::warn!(url = %url, "Token refresh failed, returning original 401");
                        return Ok(response);
                    }
                }
            }
        };

        retry
            .headers_mut()
            .insert(AUTHORIZATION, bearer_header(&token)?);

        let response = self.send_logged(retry).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(url = %url, "Still unauthorized after token refresh");
        } else {
            tracing::debug!(status = %response.status(), url = %url, "Retried request completed");
        }
        Ok(response)
    }

    async fn send_logged(&self, request: Request) -> Result<Response> {
        let url = request.url().clone();
        self.transport.send(request).await.inspect_err(|e| {
            tracing::warn!(error = %e, url = %url, "HTTP request error");
        })
    }
}

#[async_trait]
impl Transport for AuthenticatedExecutor {
    async fn send(&self, request: Request) -> Result<Response> {
        self.execute(request).await
    }
}
