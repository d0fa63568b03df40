// Request interception
// Routes requests for protected URLs through the authenticated executor

mod event;

pub use event::{Completion, EventRequest};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::{Request, Response, Url};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::http_client::AuthenticatedExecutor;
use crate::transport::Transport;

/// Path fragments that mark a protected URL
pub const DEFAULT_INCLUDE: &[&str] = &["/ai-assistant/", "/api/"];

/// Path fragments that are never intercepted (the auth endpoints themselves)
pub const DEFAULT_EXCLUDE: &[&str] = &["/api/auth/"];

/// Decides which URLs get credentials attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlMatcher {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Default for UrlMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_INCLUDE.iter().copied(), DEFAULT_EXCLUDE.iter().copied())
    }
}

impl UrlMatcher {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let clean = |patterns: Vec<String>| -> Vec<String> {
            patterns
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };

        Self {
            include: clean(include.into_iter().map(Into::into).collect()),
            exclude: clean(exclude.into_iter().map(Into::into).collect()),
        }
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// True when the path contains an include pattern and no exclude pattern
    pub fn matches(&self, url: &Url) -> bool {
        let path = url.path();
        self.include.iter().any(|p| path.contains(p.as_str()))
            && !self.exclude.iter().any(|p| path.contains(p.as_str()))
    }
}

/// Transport decorator sending protected requests through the executor
///
/// Requests that do not match go to the original transport unmodified.
pub struct InterceptionLayer {
    original: Arc<dyn Transport>,
    executor: RwLock<Arc<AuthenticatedExecutor>>,
    matcher: UrlMatcher,
}

impl InterceptionLayer {
    pub fn new(
        original: Arc<dyn Transport>,
        executor: Arc<AuthenticatedExecutor>,
        matcher: UrlMatcher,
    ) -> Self {
        Self {
            original,
            executor: RwLock::new(executor),
            matcher,
        }
    }

    pub fn matcher(&self) -> &UrlMatcher {
        &self.matcher
    }

    /// Transport that was in place before interception
    pub fn original(&self) -> &Arc<dyn Transport> {
        &self.original
    }

    /// Executor currently bound to this layer
    pub fn executor(&self) -> Arc<AuthenticatedExecutor> {
        self.executor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the executor; the original transport stays wrapped once
    pub fn rebind(&self, executor: Arc<AuthenticatedExecutor>) {
        *self
            .executor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = executor;
    }

    /// Start an event-style request bound to this layer
    pub fn new_request(self: &Arc<Self>) -> EventRequest {
        EventRequest::new(Arc::clone(self))
    }
}

#[async_trait]
impl Transport for InterceptionLayer {
    async fn send(&self, request: Request) -> Result<Response> {
        if self.matcher.matches(request.url()) {
            self.executor().execute(request).await
        } else {
            tracing::trace!(url = %request.url(), "Passing request through");
            self.original.send(request).await
        }
    }
}

/// Installs the interception layer at most once
pub struct InterceptionRegistry {
    layer: OnceCell<Arc<InterceptionLayer>>,
}

impl Default for InterceptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptionRegistry {
    pub const fn new() -> Self {
        Self {
            layer: OnceCell::new(),
        }
    }

    /// Wrap `original` on first use; later calls only rebind the executor
    pub fn install(
        &self,
        original: Arc<dyn Transport>,
        executor: Arc<AuthenticatedExecutor>,
        matcher: UrlMatcher,
    ) -> Arc<InterceptionLayer> {
        let mut created = false;
        let layer = self.layer.get_or_init(|| {
            created = true;
            Arc::new(InterceptionLayer::new(original, executor.clone(), matcher))
        });

        if created {
            tracing::info!(
                include = ?layer.matcher().include(),
                exclude = ?layer.matcher().exclude(),
                "Request interception installed"
            );
        } else {
            tracing::debug!("Interception already installed, rebinding executor");
            layer.rebind(executor);
        }

        Arc::clone(layer)
    }

    pub fn installed(&self) -> Option<Arc<InterceptionLayer>> {
        self.layer.get().cloned()
    }
}

static REGISTRY: InterceptionRegistry = InterceptionRegistry::new();

/// Install the process-wide interception layer
pub fn install(
    original: Arc<dyn Transport>,
    executor: Arc<AuthenticatedExecutor>,
    matcher: UrlMatcher,
) -> Arc<InterceptionLayer> {
    REGISTRY.install(original, executor, matcher)
}

/// The process-wide layer, if installed
pub fn installed() -> Option<Arc<InterceptionLayer>> {
    REGISTRY.installed()
}
