use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::advice::{AdviceGroup, AdviceItem};
use crate::auth::{AuthError, Authenticator, LoginRequest, RegisterRequest};
use crate::chatlog::ChatRecord;
use crate::config::AppConfig;
use crate::llm_client::CompletionBackend;
use crate::profile::Profile;
use crate::service::{ChatService, ChatSummary, SaveOutcome, ServiceError, TurnOutcome};
use crate::session::{SessionRegistry, SessionState};

pub struct ServerState {
    pub auth: Arc<Authenticator>,
    pub sessions: SessionRegistry,
    pub chat: ChatService,
}

impl ServerState {
    pub fn new(
        config: &AppConfig,
        auth: Arc<Authenticator>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            auth,
            sessions: SessionRegistry::new(),
            chat: ChatService::new(config, backend),
        }
    }
}

/// The caller's session, resolved from the bearer token by the auth middleware.
#[derive(Clone)]
struct CurrentSession {
    token: String,
    state: Arc<Mutex<SessionState>>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    username: String,
}

#[derive(Debug, Serialize)]
struct LogoutResponse {
    logged_out: bool,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SetAutosaveRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct AutosaveResponse {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RenameChatRequest {
    name: String,
}

pub async fn serve(
    config: AppConfig,
    auth: Arc<Authenticator>,
    backend: Arc<dyn CompletionBackend>,
) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| {
            format!(
                "Invalid bind address {:?} (expected host:port)",
                config.bind_addr
            )
        })?;

    let state = Arc::new(ServerState::new(&config, auth, backend));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Mindly listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let public = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .with_state(state.clone());

    let protected = Router::new()
        .route("/auth/logout", post(logout))
        .route("/session", get(get_session))
        .route("/chat/messages", post(send_message))
        .route("/chat/new", post(new_chat))
        .route("/chat/autosave", put(set_autosave))
        .route("/chats", get(list_chats).post(save_chat))
        .route("/chats/:index", get(get_chat))
        .route("/chats/:index/name", put(rename_chat))
        .route("/chats/:index/advice", post(load_chat_advice))
        .route("/profile", get(get_profile))
        .route("/advice", get(list_advice))
        .route("/advice/:uid", delete(delete_advice))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", public.merge(protected))
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let session = state.sessions.get(token).ok_or(StatusCode::UNAUTHORIZED)?;
    request.extensions_mut().insert(CurrentSession {
        token: token.to_string(),
        state: session,
    });
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn register(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, String)> {
    let auth = state.auth.clone();
    let username = body.username.clone();
    tokio::task::spawn_blocking(move || auth.register(&body))
        .await
        .map_err(|e| internal_error(e.into()))?
        .map_err(auth_error)?;
    Ok(Json(RegisterResponse { username }))
}

async fn login(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let auth = state.auth.clone();
    let username = tokio::task::spawn_blocking(move || auth.login(&body.username, &body.password))
        .await
        .map_err(|e| internal_error(e.into()))?
        .map_err(auth_error)?;

    let token = state.sessions.create(state.chat.new_session(&username));
    tracing::debug!("Opened session for {}", username);
    Ok(Json(LoginResponse { token, username }))
}

async fn logout(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
) -> Json<LogoutResponse> {
    Json(LogoutResponse {
        logged_out: state.sessions.remove(&current.token),
    })
}

async fn get_session(Extension(current): Extension<CurrentSession>) -> Json<SessionState> {
    Json(current.state.lock().await.clone())
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<TurnOutcome>, (StatusCode, String)> {
    let mut session = current.state.lock().await;
    state
        .chat
        .send_message(&mut session, &body.content)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn new_chat(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
) -> Json<SessionState> {
    let mut session = current.state.lock().await;
    state.chat.new_chat(&mut session);
    Json(session.clone())
}

async fn set_autosave(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
    Json(body): Json<SetAutosaveRequest>,
) -> Json<AutosaveResponse> {
    let mut session = current.state.lock().await;
    state.chat.set_autosave(&mut session, body.enabled);
    Json(AutosaveResponse {
        enabled: session.autosave_enabled,
    })
}

async fn save_chat(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
) -> Result<Json<SaveOutcome>, (StatusCode, String)> {
    let mut session = current.state.lock().await;
    state
        .chat
        .save_current(&mut session)
        .map(Json)
        .map_err(service_error)
}

async fn list_chats(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
) -> Json<Vec<ChatSummary>> {
    let session = current.state.lock().await;
    Json(state.chat.list_chats(&session))
}

async fn get_chat(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
    Path(index): Path<usize>,
) -> Result<Json<ChatRecord>, (StatusCode, String)> {
    let session = current.state.lock().await;
    state
        .chat
        .get_chat(&session, index)
        .map(Json)
        .map_err(service_error)
}

async fn rename_chat(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
    Path(index): Path<usize>,
    Json(body): Json<RenameChatRequest>,
) -> Result<Json<ChatRecord>, (StatusCode, String)> {
    let session = current.state.lock().await;
    state
        .chat
        .rename_chat(&session, index, &body.name)
        .map(Json)
        .map_err(service_error)
}

async fn load_chat_advice(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
    Path(index): Path<usize>,
) -> Result<Json<Vec<AdviceItem>>, (StatusCode, String)> {
    let mut session = current.state.lock().await;
    state
        .chat
        .load_chat_advice(&mut session, index)
        .map(Json)
        .map_err(service_error)
}

async fn get_profile(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
) -> Json<Profile> {
    let session = current.state.lock().await;
    Json(state.chat.profile(&session).await)
}

async fn list_advice(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
) -> Json<Vec<AdviceGroup>> {
    let mut session = current.state.lock().await;
    Json(state.chat.advice(&mut session).await)
}

async fn delete_advice(
    State(state): State<Arc<ServerState>>,
    Extension(current): Extension<CurrentSession>,
    Path(uid): Path<String>,
) -> Result<Json<AdviceItem>, (StatusCode, String)> {
    let mut session = current.state.lock().await;
    state
        .chat
        .delete_advice(&mut session, &uid)
        .map(Json)
        .map_err(service_error)
}

fn auth_error(error: AuthError) -> (StatusCode, String) {
    match error {
        AuthError::Validation(message) => (StatusCode::BAD_REQUEST, message),
        other @ (AuthError::UnknownUser | AuthError::IncorrectPassword) => {
            (StatusCode::UNAUTHORIZED, other.to_string())
        }
        AuthError::Storage(e) => internal_error(e),
    }
}

fn service_error(error: ServiceError) -> (StatusCode, String) {
    match error {
        ServiceError::Invalid(message) => (StatusCode::BAD_REQUEST, message),
        ServiceError::NotFound(message) => not_found(message),
        ServiceError::Storage(e) => internal_error(e),
    }
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("Request failed: {:#}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::scripted::ScriptedBackend;
    use axum::body::Body;
    use axum::http::{HeaderValue, Method, Request};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app(replies: &[&str]) -> (TempDir, Router) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig {
            config_dir: dir.path().join("config").to_string_lossy().to_string(),
            userdata_dir: dir.path().join("userdata").to_string_lossy().to_string(),
            ..AppConfig::default()
        };
        let auth = Arc::new(Authenticator::open(config.credentials_path()).expect("auth store"));
        let backend = Arc::new(ScriptedBackend::replying(replies));
        let state = Arc::new(ServerState::new(&config, auth, backend));
        (dir, build_router(state))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
        (status, value)
    }

    async fn register_and_login(app: &Router) -> String {
        let (status, _) = call(
            app,
            Method::POST,
            "/v1/auth/register",
            None,
            Some(json!({
                "username": "alice",
                "password": "password1",
                "confirm": "password1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            app,
            Method::POST,
            "/v1/auth/login",
            None,
            Some(json!({"username": "alice", "password": "password1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "alice");
        body["token"].as_str().unwrap().to_string()
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_dir, app) = test_app(&[]);
        let (status, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn protected_routes_require_session_token() {
        let (_dir, app) = test_app(&[]);
        let (status, _) = call(&app, Method::GET, "/v1/session", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, Method::GET, "/v1/session", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_validation_and_login_failures_map_to_status_codes() {
        let (_dir, app) = test_app(&[]);
        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/auth/register",
            None,
            Some(json!({"username": "bob", "password": "short", "confirm": "short"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Password must be at least 8 characters");

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/auth/login",
            None,
            Some(json!({"username": "nobody", "password": "whatever1"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Username not found");
    }

    #[tokio::test]
    async fn chat_flow_over_http() {
        let (_dir, app) = test_app(&["I understand. You might try writing it down."]);
        let token = register_and_login(&app).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/chat/messages",
            Some(&token),
            Some(json!({"content": "Work has been a lot lately"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"]["source"], "completion");
        assert_eq!(body["traits"]["Empathy"], 1);
        assert_eq!(body["autosaved"], true);

        let (status, body) = call(&app, Method::GET, "/v1/chats", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["label"], "Chat 1");
        assert_eq!(body[0]["message_count"], 3);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/v1/chats/0/name",
            Some(&token),
            Some(json!({"name": "Monday"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["display_name"], "Monday");

        let (status, _) = call(&app, Method::GET, "/v1/chats/7", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::GET, "/v1/session", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["advice_points"].as_array().unwrap().len(), 1);
        let uid = body["advice_points"][0]["uid"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            Method::DELETE,
            &format!("/v1/advice/{uid}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            Method::DELETE,
            &format!("/v1/advice/{uid}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn blank_message_is_bad_request() {
        let (_dir, app) = test_app(&[]);
        let token = register_and_login(&app).await;
        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/chat/messages",
            Some(&token),
            Some(json!({"content": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn autosave_toggle_and_new_chat() {
        let (_dir, app) = test_app(&[]);
        let token = register_and_login(&app).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/v1/chat/autosave",
            Some(&token),
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);

        let (status, body) = call(&app, Method::POST, "/v1/chat/new", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["autosave_enabled"], false);
    }

    #[tokio::test]
    async fn manual_save_then_profile() {
        let (_dir, app) = test_app(&["You reflect with care."]);
        let token = register_and_login(&app).await;

        let (status, body) = call(&app, Method::POST, "/v1/chats", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["saved"], true);
        assert_eq!(body["index"], 0);

        let (status, body) = call(&app, Method::GET, "/v1/profile", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_traits"], false);
        assert_eq!(body["summary"], "You reflect with care.");
    }

    #[tokio::test]
    async fn logout_invalidates_token() {
        let (_dir, app) = test_app(&[]);
        let token = register_and_login(&app).await;

        let (status, body) = call(&app, Method::POST, "/v1/auth/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logged_out"], true);

        let (status, _) = call(&app, Method::GET, "/v1/session", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
