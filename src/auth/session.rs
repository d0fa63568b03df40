// Session state
// Derived session state machine and the shared sign-out procedure

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use super::api::AuthApi;
use super::credentials::CredentialStore;
use super::types::User;

/// Where the session currently is
///
/// `Authenticating` and `RefreshInFlight` are transient; outside observers
/// usually only look at [`SessionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    RefreshInFlight,
}

impl SessionState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::RefreshInFlight)
    }

    pub fn is_loading(self) -> bool {
        matches!(self, SessionState::Authenticating)
    }
}

/// Snapshot exposed to consumers
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub user: Option<User>,
}

/// Session core shared by the lifecycle and the refresh coordinator
pub struct Session {
    store: Arc<CredentialStore>,
    api: AuthApi,
    state: watch::Sender<SessionState>,
    user: RwLock<Option<User>>,
    logout_timeout: Duration,
}

impl Session {
    pub fn new(store: Arc<CredentialStore>, api: AuthApi, logout_timeout: Duration) -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            store,
            api,
            state,
            user: RwLock::new(None),
            logout_timeout,
        }
    }

    pub(crate) fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub(crate) fn api(&self) -> &AuthApi {
        &self.api
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Session state changed");
        }
    }

    pub async fn user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    pub(crate) async fn set_user(&self, user: Option<User>) {
        *self.user.write().await = user;
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            state,
            is_authenticated: state.is_authenticated(),
            is_loading: state.is_loading(),
            user: self.user().await,
        }
    }

    /// Sign out locally, telling the server first when possible
    ///
    /// The server call is bounded by the logout timeout and its failure is
    /// only logged. Local state is cleared no matter what.
    pub(crate) async fn end(&self, reason: &str) {
        let credential = self.store.get().await;

        if let (Some(access), Some(refresh)) = (
            credential.access_token.as_deref(),
            credential.refresh_token.as_deref(),
        ) {
            match tokio::time::timeout(self.logout_timeout, self.api.logout(access, refresh))
                .await
            {
                Ok(Ok(())) => tracing::debug!("Refresh token revoked on server"),
                Ok(Err(e)) => tracing::warn!("Server logout failed (ignored): {}", e),
                Err(_) => tracing::warn!(
                    "Server logout timed out after {:?} (ignored)",
                    self.logout_timeout
                ),
            }
        }

        self.store.clear().await;
        self.set_user(None).await;
        self.transition(SessionState::Unauthenticated);

        tracing::info!(reason, "Session ended");
    }
}
