// Scripted in-process transport for unit tests

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, Request, Response, Url};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::{AuthApi, CredentialStore, MemoryKeyValueStore, RefreshCoordinator, Session};
use crate::error::Result;
use crate::http_client::AuthenticatedExecutor;
use crate::interception::{InterceptionLayer, UrlMatcher};
use crate::transport::Transport;

pub const BASE_URL: &str = "http://relay.test";

/// What the scripted server saw
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// Canned response, optionally delayed
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }
}

type Handler = Box<dyn Fn(&Recorded) -> Reply + Send + Sync>;

pub struct ScriptedTransport {
    handler: Handler,
    log: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    pub fn authorizations(&self, path: &str) -> Vec<Option<String>> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .map(|r| r.authorization)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let recorded = Recorded {
            method: request.method().clone(),
            path: request.url().path().to_string(),
            authorization: request
                .headers()
                .get_all(AUTHORIZATION)
                .iter()
                .map(|v| v.to_str().unwrap_or_default().to_string())
                .reduce(|a, b| format!("{}, {}", a, b)),
            headers: request.headers().clone(),
            body: request.body().and_then(|b| b.as_bytes()).map(|b| b.to_vec()),
        };
        self.log.lock().unwrap().push(recorded.clone());

        let reply = (self.handler)(&recorded);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        let response = axum::http::Response::builder()
            .status(reply.status)
            .header("content-type", "application/json")
            .body(reply.body)
            .unwrap();
        Ok(Response::from(response))
    }
}

/// Session + coordinator wired to a scripted transport and seeded store
pub fn auth_stack(
    transport: Arc<ScriptedTransport>,
    entries: &[(&str, &str)],
) -> (Arc<Session>, Arc<RefreshCoordinator>) {
    let durable = Arc::new(MemoryKeyValueStore::with_entries(entries.iter().copied()));
    let store = Arc::new(CredentialStore::open(durable).unwrap());
    let api = AuthApi::new(transport, Url::parse(BASE_URL).unwrap());
    let session = Arc::new(Session::new(store, api, Duration::from_secs(1)));
    let coordinator = Arc::new(RefreshCoordinator::new(session.clone()));
    (session, coordinator)
}

/// Interception layer with default patterns over a scripted transport
pub fn layer_stack(
    transport: Arc<ScriptedTransport>,
    entries: &[(&str, &str)],
) -> Arc<InterceptionLayer> {
    let (session, coordinator) = auth_stack(transport.clone(), entries);
    let executor =
        AuthenticatedExecutor::new(transport.clone(), session.store().clone(), coordinator);
    Arc::new(InterceptionLayer::new(
        transport,
        Arc::new(executor),
        UrlMatcher::default(),
    ))
}
