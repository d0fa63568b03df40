// Token refresh logic
// Single-flight refresh: concurrent callers share one network exchange

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::session::{Session, SessionState};
use super::types::Credential;

type RefreshFuture = Shared<BoxFuture<'static, Option<String>>>;

/// Performs token refresh with at most one exchange in flight
///
/// Every caller that arrives while a refresh is pending or resolving awaits
/// the same result. The marker is cleared by the first caller that observes
/// the outcome. The exchange runs on its own task, so dropping all callers
/// does not abort it.
pub struct RefreshCoordinator {
    session: Arc<Session>,
    in_flight: Mutex<Option<RefreshFuture>>,
    network_refreshes: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            in_flight: Mutex::new(None),
            network_refreshes: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Number of refresh exchanges actually sent to the server
    pub fn network_refreshes(&self) -> u64 {
        self.network_refreshes.load(Ordering::Relaxed)
    }

    /// Obtain a new access token, or `None` after signing the session out
    pub async fn refresh(self: &Arc<Self>) -> Option<String> {
        let (pending, joined) = self.join_or_start();
        if joined {
            tracing::debug!("Joining in-flight token refresh");
        }

        let token = pending.clone().await;
        self.finish(&pending);
        token
    }

    fn join_or_start(self: &Arc<Self>) -> (RefreshFuture, bool) {
        let mut slot = self.slot();

        // A resolved but uncleared refresh is still joined; it yields at once
        if let Some(pending) = slot.as_ref() {
            return (pending.clone(), true);
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run().await });
        let pending = async move {
            match task.await {
                Ok(token) => token,
                Err(e) => {
                    tracing::error!("Token refresh task failed: {}", e);
                    None
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(pending.clone());
        (pending, false)
    }

    fn finish(&self, pending: &RefreshFuture) {
        let mut slot = self.slot();
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(pending))
        {
            *slot = None;
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<RefreshFuture>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(&self) -> Option<String> {
        let store = self.session.store();

        let Some(refresh_token) = store.get().await.refresh_token else {
            tracing::warn!("No refresh token available, signing out");
            self.session.end("no refresh token").await;
            return None;
        };

        let resume = self.session.state();
        if resume == SessionState::Authenticated {
            self.session.transition(SessionState::RefreshInFlight);
        }

        tracing::info!("Refreshing access token...");
        self.network_refreshes.fetch_add(1, Ordering::Relaxed);

        let data = match self.session.api().refresh(&refresh_token).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(kind = e.kind(), "Token refresh failed, signing out: {}", e);
                self.session.end("refresh failed").await;
                return None;
            }
        };

        // Keep the old refresh token unless the server rotated it
        let rotated = data.refresh.filter(|r| !r.is_empty());
        let was_rotated = rotated.is_some();
        let next = Credential {
            access_token: Some(data.access.clone()),
            refresh_token: Some(rotated.unwrap_or(refresh_token)),
        };

        if let Err(e) = store.set(next).await {
            tracing::error!("Could not persist refreshed credentials: {}", e);
            self.session.end("refreshed credentials not persisted").await;
            return None;
        }

        // Restore owns Authenticating; a signed-out session stays signed out
        if matches!(
            resume,
            SessionState::Authenticated | SessionState::RefreshInFlight
        ) {
            self.session.transition(SessionState::Authenticated);
        }

        tracing::info!(rotated = was_rotated, "Access token refreshed");
        Some(data.access)
    }
}
