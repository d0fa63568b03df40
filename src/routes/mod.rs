use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, Uri},
    middleware as axum_middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthManager, LoginRequest, RegisterRequest, SessionStatus};
use crate::error::{RelayError, Result};
use crate::interception::InterceptionLayer;
use crate::middleware;
use crate::transport::Transport;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub auth_manager: Arc<AuthManager>,
    pub layer: Arc<InterceptionLayer>,
    pub upstream_url: Url,
    pub relay_api_key: String,
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new().route("/_relay/health", get(health_handler))
}

/// Relay control routes under `/_relay` (require authentication)
pub fn relay_routes(state: AppState) -> Router {
    Router::new()
        .route("/_relay/session", get(session_handler))
        .route("/_relay/login", post(login_handler))
        .route("/_relay/register", post(register_handler))
        .route("/_relay/logout", post(logout_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Everything else is forwarded upstream through the interception layer
/// (requires authentication)
pub fn proxy_routes(state: AppState) -> Router {
    Router::new()
        .fallback(forward_handler)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Build the application with all routes and middleware
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(relay_routes(state.clone()))
        .merge(proxy_routes(state))
        .layer(middleware::cors_layer())
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

/// GET /_relay/health
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": VERSION,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// GET /_relay/session
async fn session_handler(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.auth_manager.status().await)
}

/// POST /_relay/login
async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<SessionStatus>> {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(RelayError::Validation(
            "username and password are required".to_string(),
        ));
    }

    state
        .auth_manager
        .login(&body.username, &body.password)
        .await?;
    Ok(Json(state.auth_manager.status().await))
}

/// POST /_relay/register
async fn register_handler(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<SessionStatus>> {
    state.auth_manager.register(body).await?;
    Ok(Json(state.auth_manager.status().await))
}

/// POST /_relay/logout
async fn logout_handler(State(state): State<AppState>) -> Json<SessionStatus> {
    state.auth_manager.logout().await;
    Json(state.auth_manager.status().await)
}

/// Forward any other request to the upstream server
async fn forward_handler(State(state): State<AppState>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let target = upstream_target(&state.upstream_url, &parts.uri);

    let body = body
        .collect()
        .await
        .map_err(|e| RelayError::Validation(format!("Failed to read request body: {}", e)))?
        .to_bytes();

    tracing::debug!(method = %parts.method, target = %target, "Forwarding request upstream");

    let mut outgoing = reqwest::Request::new(parts.method, target);
    *outgoing.headers_mut() = forwardable_headers(&parts.headers);
    if !body.is_empty() {
        *outgoing.body_mut() = Some(body.into());
    }

    let upstream = state.layer.send(outgoing).await?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        *headers = forwardable_headers(upstream.headers());
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| RelayError::Internal(anyhow::anyhow!("Failed to build response: {}", e)))
}

/// Upstream base joined with the incoming path and query
fn upstream_target(base: &Url, uri: &Uri) -> Url {
    let mut target = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), uri.path());
    target.set_path(&path);
    target.set_query(uri.query());
    target
}

/// Copy headers minus hop-by-hop ones and `Host`
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) && *name != header::HOST {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        CredentialStore, MemoryKeyValueStore, ACCESS_TOKEN_KEY, LOGIN_PATH,
        REFRESH_TOKEN_KEY,
    };
    use crate::interception::UrlMatcher;
    use crate::test_support::{Reply, ScriptedTransport, BASE_URL};
    use axum::http::{Method, StatusCode};
    use std::time::Duration;
    use tower::util::ServiceExt;

    const RELAY_KEY: &str = "relay-secret";

    fn create_test_state(transport: Arc<ScriptedTransport>, entries: &[(&str, &str)]) -> AppState {
        let durable = Arc::new(MemoryKeyValueStore::with_entries(entries.iter().copied()));
        let store = Arc::new(CredentialStore::open(durable).unwrap());
        let base = Url::parse(BASE_URL).unwrap();
        let auth_manager = Arc::new(AuthManager::new(
            store,
            transport.clone(),
            base.clone(),
            Duration::from_secs(1),
        ));
        let executor = Arc::new(auth_manager.executor(transport.clone()));
        let layer = Arc::new(InterceptionLayer::new(
            transport,
            executor,
            UrlMatcher::default(),
        ));

        AppState {
            auth_manager,
            layer,
            upstream_url: base,
            relay_api_key: RELAY_KEY.to_string(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(middleware::API_KEY_HEADER, RELAY_KEY);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[test]
    fn test_upstream_target_keeps_prefix_and_query() {
        let base = Url::parse("http://upstream.local/prefix/").unwrap();
        let uri: Uri = "/api/items?page=2".parse().unwrap();
        assert_eq!(
            upstream_target(&base, &uri).as_str(),
            "http://upstream.local/prefix/api/items?page=2"
        );

        let base = Url::parse("http://upstream.local").unwrap();
        let uri: Uri = "/ai-assistant/chat".parse().unwrap();
        assert_eq!(
            upstream_target(&base, &uri).as_str(),
            "http://upstream.local/ai-assistant/chat"
        );
    }

    #[test]
    fn test_forwardable_headers_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("host", "relay.local".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());

        let out = forwardable_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out["accept"], "application/json");
    }

    #[tokio::test]
    async fn test_health() {
        let transport = ScriptedTransport::new(|_| Reply::ok("{}"));
        let app = build_app(create_test_state(transport.clone(), &[]));

        let response = app
            .oneshot(request(Method::GET, "/_relay/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(middleware::REQUEST_ID_HEADER));

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], VERSION);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_login_then_session() {
        let transport = ScriptedTransport::new(|_| {
            Reply::ok(r#"{"user":{"id":7,"username":"alice"},"access":"A1","refresh":"R1"}"#)
        });
        let state = create_test_state(transport.clone(), &[]);
        let app = build_app(state);

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/_relay/login",
                Some(json!({"username": "alice", "password": "secret123"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["is_authenticated"], true);
        assert_eq!(body["user"]["username"], "alice");
        assert_eq!(transport.count(LOGIN_PATH), 1);

        let response = app
            .oneshot(request(Method::GET, "/_relay/session", None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["state"], "authenticated");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let transport = ScriptedTransport::new(|_| Reply {
            status: 401,
            body: r#"{"error":"Invalid credentials"}"#.to_string(),
            delay: Duration::ZERO,
        });
        let app = build_app(create_test_state(transport, &[]));

        let response = app
            .oneshot(request(
                Method::POST,
                "/_relay/login",
                Some(json!({"username": "alice", "password": "nope"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "Invalid credentials");
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn test_login_requires_fields() {
        let transport = ScriptedTransport::new(|_| Reply::ok("{}"));
        let app = build_app(create_test_state(transport.clone(), &[]));

        let response = app
            .oneshot(request(
                Method::POST,
                "/_relay/login",
                Some(json!({"username": " ", "password": ""})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let transport = ScriptedTransport::new(|_| Reply::status(503));
        let state = create_test_state(
            transport,
            &[(ACCESS_TOKEN_KEY, "A1"), (REFRESH_TOKEN_KEY, "R1")],
        );
        let app = build_app(state.clone());

        let response = app
            .oneshot(request(Method::POST, "/_relay/logout", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["is_authenticated"], false);
        assert!(state.auth_manager.credentials().credential().await.is_empty());
    }

    #[tokio::test]
    async fn test_forward_attaches_token_only_to_protected_paths() {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            "/api/items" => Reply::ok(r#"{"items":[]}"#),
            _ => Reply::ok("plain"),
        });
        let app = build_app(create_test_state(
            transport.clone(),
            &[(ACCESS_TOKEN_KEY, "A1"), (REFRESH_TOKEN_KEY, "R1")],
        ));

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/items?page=1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["items"], json!([]));

        let response = app
            .oneshot(request(Method::GET, "/static/app.js", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            transport.authorizations("/api/items"),
            vec![Some("Bearer A1".to_string())]
        );
        assert_eq!(transport.authorizations("/static/app.js"), vec![None]);
    }

    #[tokio::test]
    async fn test_gateway_rejects_missing_api_key() {
        let transport = ScriptedTransport::new(|_| Reply::ok(r#"{"secret":"private data"}"#));
        let app = build_app(create_test_state(
            transport.clone(),
            &[(ACCESS_TOKEN_KEY, "A1"), (REFRESH_TOKEN_KEY, "R1")],
        ));

        for uri in ["/api/private", "/_relay/session"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .header("origin", "http://evil.example")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let body = body_json(response).await;
            assert_eq!(body["error"]["type"], "authentication_error");
            assert!(body.get("user").is_none());
        }

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/_relay/logout")
                    .header(middleware::API_KEY_HEADER, "wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_key_is_not_forwarded() {
        let transport = ScriptedTransport::new(|_| Reply::ok("{}"));
        let app = build_app(create_test_state(
            transport.clone(),
            &[(ACCESS_TOKEN_KEY, "A1"), (REFRESH_TOKEN_KEY, "R1")],
        ));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/items")
                    .header("authorization", format!("Bearer {}", RELAY_KEY))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request(Method::GET, "/static/app.js", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The relay key is replaced by the session token on protected paths
        assert_eq!(
            transport.authorizations("/api/items"),
            vec![Some("Bearer A1".to_string())]
        );
        assert_eq!(transport.authorizations("/static/app.js"), vec![None]);
        assert!(transport
            .requests()
            .iter()
            .all(|sent| !sent.headers.contains_key(middleware::API_KEY_HEADER)));
    }

    #[tokio::test]
    async fn test_forward_passes_body_and_status() {
        let transport = ScriptedTransport::new(|_| Reply::status(422));
        let app = build_app(create_test_state(transport.clone(), &[]));

        let response = app
            .oneshot(request(
                Method::POST,
                "/ai-assistant/chat",
                Some(json!({"prompt": "hi"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let sent = &transport.requests()[0];
        assert_eq!(sent.method, Method::POST);
        let body: Value = serde_json::from_slice(sent.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["prompt"], "hi");
    }
}
