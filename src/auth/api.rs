// Auth endpoint client
// Typed calls to the login/register/refresh/logout/profile endpoints

use reqwest::header::AUTHORIZATION;
use reqwest::{Method, Request, Response, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;

use super::types::{
    ErrorBody, LoginRequest, LoginResponse, LogoutRequest, RefreshRequest, RefreshResponse,
    RegisterRequest, User,
};
use crate::error::{RelayError, Result};
use crate::transport::{bearer_header, json_request, Transport};

pub const LOGIN_PATH: &str = "/api/auth/login/";
pub const REGISTER_PATH: &str = "/api/auth/register/";
pub const REFRESH_PATH: &str = "/api/auth/refresh/";
pub const LOGOUT_PATH: &str = "/api/auth/logout/";
pub const PROFILE_PATH: &str = "/api/auth/profile/";

/// Client for the auth endpoints
///
/// Talks over the raw transport: these calls must never pass through the
/// authenticated executor, or a rejected refresh would try to refresh itself.
#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn Transport>,
    base_url: Url,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn Transport>, base_url: Url) -> Self {
        Self {
            transport,
            base_url,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RelayError::Validation(format!("Invalid auth endpoint {}: {}", path, e)))
    }

    async fn send(&self, request: Request) -> Result<Response> {
        let url = request.url().clone();
        let response = self.transport.send(request).await?;
        tracing::debug!(url = %url, status = %response.status(), "Auth endpoint responded");
        Ok(response)
    }

    /// POST login; rejection carries the server's message
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let request = json_request(Method::POST, self.endpoint(LOGIN_PATH)?, &body)?;
        let response = self.send(request).await?;

        if !response.status().is_success() {
            let message = error_message(response)
                .await
                .unwrap_or_else(|| "Login failed".to_string());
            return Err(RelayError::Authentication(message));
        }

        let data: LoginResponse = response.json().await.map_err(|e| {
            RelayError::Authentication(format!("Malformed login response: {}", e))
        })?;

        if data.access.is_empty() {
            return Err(RelayError::Authentication(
                "Login response does not contain an access token".to_string(),
            ));
        }

        Ok(data)
    }

    /// POST register; rejection joins every field message
    pub async fn register(&self, data: &RegisterRequest) -> Result<()> {
        let request = json_request(Method::POST, self.endpoint(REGISTER_PATH)?, data)?;
        let response = self.send(request).await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let messages = field_messages(&body);
        tracing::warn!(status = %status, "Registration rejected: {:?}", messages);

        if messages.is_empty() {
            Err(RelayError::Authentication("Registration failed".to_string()))
        } else {
            Err(RelayError::Authentication(messages.join(", ")))
        }
    }

    /// POST refresh; the pair is only usable when this returns `Ok`
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let body = RefreshRequest {
            refresh: refresh_token,
        };
        let request = json_request(Method::POST, self.endpoint(REFRESH_PATH)?, &body)?;
        let response = self.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RelayError::RefreshFailed {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let data: RefreshResponse =
            response
                .json()
                .await
                .map_err(|e| RelayError::RefreshFailed {
                    status: status.as_u16(),
                    message: format!("Malformed refresh response: {}", e),
                })?;

        if data.access.is_empty() {
            return Err(RelayError::RefreshFailed {
                status: status.as_u16(),
                message: "Refresh response does not contain an access token".to_string(),
            });
        }

        Ok(data)
    }

    /// POST logout to revoke the refresh token
    pub async fn logout(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let body = LogoutRequest { refresh_token };
        let mut request = json_request(Method::POST, self.endpoint(LOGOUT_PATH)?, &body)?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, bearer_header(access_token)?);

        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Internal(anyhow::anyhow!(
                "Logout rejected by server: {}",
                status
            )));
        }

        Ok(())
    }

    /// GET profile; a 401 maps to `SessionExpired`
    pub async fn profile(&self, access_token: &str) -> Result<User> {
        let mut request = Request::new(Method::GET, self.endpoint(PROFILE_PATH)?);
        request
            .headers_mut()
            .insert(AUTHORIZATION, bearer_header(access_token)?);

        let response = self.send(request).await?;
        match response.status() {
            status if status.is_success() => response.json().await.map_err(|e| {
                RelayError::Internal(anyhow::anyhow!("Malformed profile response: {}", e))
            }),
            StatusCode::UNAUTHORIZED => Err(RelayError::SessionExpired),
            status => Err(RelayError::Internal(anyhow::anyhow!(
                "Profile request failed: {}",
                status
            ))),
        }
    }
}

/// `error` field of a failure body, if any
async fn error_message(response: Response) -> Option<String> {
    let body: ErrorBody = response.json().await.ok()?;
    body.error.filter(|m| !m.is_empty())
}

/// Flatten a field -> messages map into a list of messages, in server order
///
/// String values and one level of arrays are kept; anything deeper is
/// ignored.
pub fn field_messages(body: &Value) -> Vec<String> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    match body {
        Value::Object(fields) => fields
            .values()
            .flat_map(|value| match value {
                Value::Array(items) => items.iter().filter_map(scalar).collect::<Vec<_>>(),
                other => scalar(other).into_iter().collect(),
            })
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}
