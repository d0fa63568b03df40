use anyhow::Result as AnyResult;
use reqwest::Url;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::api::AuthApi;
use super::credentials::{CredentialReader, CredentialStore, SqliteKeyValueStore};
use super::refresh::RefreshCoordinator;
use super::session::{Session, SessionState, SessionStatus};
use super::types::{Credential, RegisterRequest, User};
use crate::error::{RelayError, Result};
use crate::http_client::AuthenticatedExecutor;
use crate::transport::Transport;

/// Authentication manager
/// Owns login, registration, logout and session restore
pub struct AuthManager {
    session: Arc<Session>,
    refresher: Arc<RefreshCoordinator>,
}

impl AuthManager {
    /// Create a manager over an already opened credential store
    ///
    /// `transport` is the raw (non-intercepted) transport used for the auth
    /// endpoints themselves.
    pub fn new(
        store: Arc<CredentialStore>,
        transport: Arc<dyn Transport>,
        auth_base_url: Url,
        logout_timeout: Duration,
    ) -> Self {
        let api = AuthApi::new(transport, auth_base_url);
        let session = Arc::new(Session::new(store, api, logout_timeout));
        let refresher = Arc::new(RefreshCoordinator::new(session.clone()));

        Self { session, refresher }
    }

    /// Create a manager persisting credentials in the SQLite file at `db_path`
    pub fn open(
        db_path: &Path,
        transport: Arc<dyn Transport>,
        auth_base_url: Url,
        logout_timeout: Duration,
    ) -> AnyResult<Self> {
        tracing::info!("Loading credentials from SQLite: {}", db_path.display());
        let durable = Arc::new(SqliteKeyValueStore::open(db_path)?);
        let store = Arc::new(CredentialStore::open(durable)?);

        Ok(Self::new(store, transport, auth_base_url, logout_timeout))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    /// Read-only view of the credentials for code that must not mutate them
    pub fn credentials(&self) -> Arc<dyn CredentialReader> {
        self.session.store().clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.status().await
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Executor attaching this session's credentials to requests sent over `transport`
    pub fn executor(&self, transport: Arc<dyn Transport>) -> AuthenticatedExecutor {
        AuthenticatedExecutor::new(
            transport,
            self.session.store().clone(),
            self.refresher.clone(),
        )
    }

    /// Log in with username and password
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        tracing::info!("Logging in user: {}", username);

        let previous = self.session.state();
        self.session.transition(SessionState::Authenticating);

        let data = match self.session.api().login(username, password).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(kind = e.kind(), "Login failed: {}", e);
                self.session.transition(fallback_state(previous));
                return Err(e);
            }
        };

        if let Err(e) = self
            .session
            .store()
            .set(Credential::new(data.access, data.refresh))
            .await
        {
            tracing::error!("Could not persist login credentials: {}", e);
            self.session.transition(fallback_state(previous));
            return Err(e);
        }

        self.session.set_user(Some(data.user.clone())).await;
        self.session.transition(SessionState::Authenticated);

        tracing::info!("Login successful: {}", data.user.username);
        Ok(data.user)
    }

    /// Register a new account, then log in with the same credentials
    pub async fn register(&self, data: RegisterRequest) -> Result<User> {
        tracing::info!("Registering user: {}", data.username);

        if let Err(e) = self.session.api().register(&data).await {
            tracing::warn!(kind = e.kind(), "Registration failed: {}", e);
            return Err(e);
        }

        tracing::info!("Registration successful, logging in");
        self.login(&data.username, &data.password).await
    }

    /// Log out; always succeeds locally
    pub async fn logout(&self) {
        tracing::info!("Logging out");
        self.session.end("logout").await;
    }

    /// Rebuild the session from stored credentials (process start)
    pub async fn restore(&self) -> SessionStatus {
        let credential = self.session.store().get().await;

        let Some(access_token) = credential.access_token else {
            tracing::info!("No stored session");
            self.session.transition(SessionState::Unauthenticated);
            return self.status().await;
        };

        tracing::info!("Restoring stored session");
        self.session.transition(SessionState::Authenticating);

        match self.session.api().profile(&access_token).await {
            Ok(user) => self.accept_profile(user).await,
            Err(RelayError::SessionExpired) => {
                tracing::info!("Stored access token rejected, refreshing");
                match self.refresher.refresh().await {
                    Some(token) => self.retry_profile(&token).await,
                    None => tracing::warn!("Stored session could not be refreshed"),
                }
            }
            Err(e) => {
                tracing::warn!("Could not load user profile: {}", e);
                self.session.transition(SessionState::Unauthenticated);
            }
        }

        self.status().await
    }

    async fn retry_profile(&self, access_token: &str) {
        match self.session.api().profile(access_token).await {
            Ok(user) => self.accept_profile(user).await,
            Err(RelayError::SessionExpired) => {
                tracing::warn!("Refreshed access token rejected by profile endpoint");
                self.session.end("refreshed token rejected").await;
            }
            Err(e) => {
                tracing::warn!("Could not load user profile after refresh: {}", e);
                self.session.transition(SessionState::Unauthenticated);
            }
        }
    }

    async fn accept_profile(&self, user: User) {
        tracing::info!("User profile loaded: {}", user.username);
        self.session.set_user(Some(user)).await;
        self.session.transition(SessionState::Authenticated);
    }
}

/// State to fall back to after a failed login
fn fallback_state(previous: SessionState) -> SessionState {
    if previous.is_authenticated() {
        SessionState::Authenticated
    } else {
        SessionState::Unauthenticated
    }
}
