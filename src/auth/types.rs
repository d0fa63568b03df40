// Authentication types

use serde::{Deserialize, Serialize};

/// Durable key holding the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Durable key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Current access/refresh credential pair
///
/// An absent access token means the user is unauthenticated, whatever the
/// refresh token says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

/// Signed-in user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub user: User,
    pub access: String,
    pub refresh: String,
}

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password2: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Refresh request
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh response
///
/// `refresh` is only present when the server rotates refresh tokens.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Logout request
#[derive(Serialize)]
pub struct LogoutRequest<'a> {
    pub refresh_token: &'a str,
}

/// Error body returned by the login and refresh endpoints
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: Option<String>,
}
