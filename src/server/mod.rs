use crate::engine::{ConsoleCommand, StatusSnapshot};
use crate::model::ResourceKind;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

struct ServerState {
    token: String,
    snapshots: watch::Receiver<StatusSnapshot>,
    commands: mpsc::Sender<ConsoleCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    token: String,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountRequest {
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NavigateRequest {
    path: String,
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    snapshots: watch::Receiver<StatusSnapshot>,
    commands: mpsc::Sender<ConsoleCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(ServerState {
        token,
        snapshots,
        commands,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/ws", get(ws_handler))
        .route("/session/login", post(login))
        .route("/session/account", post(switch_account))
        .route("/session/logout", post(logout))
        .route("/session/token", post(rotate_token))
        .route("/navigate", post(navigate))
        .route("/alerts/:id/dismiss", post(dismiss_alert))
        .route("/caches/:kind", get(read_cache).put(load_cache))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

async fn status(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let snapshot = state.snapshots.borrow().clone();
    (StatusCode::OK, Json(snapshot)).into_response()
}

async fn login(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.token.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "token must not be empty").into_response();
    }
    dispatch(
        &state,
        ConsoleCommand::Login {
            token: body.token,
            account_id: body.account_id,
        },
    )
    .await
}

async fn switch_account(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(body): Json<AccountRequest>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    dispatch(
        &state,
        ConsoleCommand::SwitchAccount {
            account_id: body.account_id,
        },
    )
    .await
}

async fn logout(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    dispatch(&state, ConsoleCommand::Logout).await
}

async fn rotate_token(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(body): Json<TokenRequest>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    dispatch(&state, ConsoleCommand::RotateToken { token: body.token }).await
}

async fn navigate(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(body): Json<NavigateRequest>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    dispatch(&state, ConsoleCommand::Navigate { path: body.path }).await
}

async fn dismiss_alert(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Path(id): Path<Uuid>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let (reply, answer) = oneshot::channel();
    if state
        .commands
        .send(ConsoleCommand::DismissAlert { id, reply })
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match answer.await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn read_cache(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Path(kind): Path<String>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(kind) = cacheable_kind(&kind) else {
        return (StatusCode::NOT_FOUND, "unknown resource kind").into_response();
    };
    let (reply, answer) = oneshot::channel();
    if state
        .commands
        .send(ConsoleCommand::ReadCache { kind, reply })
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match answer.await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// The API client seeds a collection after a list fetch.
async fn load_cache(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Path(kind): Path<String>,
    Json(records): Json<Vec<Value>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(kind) = cacheable_kind(&kind) else {
        return (StatusCode::NOT_FOUND, "unknown resource kind").into_response();
    };
    dispatch(&state, ConsoleCommand::LoadCache { kind, records }).await
}

async fn dispatch(state: &ServerState, command: ConsoleCommand) -> Response {
    match state.commands.send(command).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => {
            tracing::warn!("sync engine stopped; console command rejected");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Status-only and unrecognised tags never have a cache.
fn cacheable_kind(tag: &str) -> Option<ResourceKind> {
    let kind = ResourceKind::from_tag(tag);
    match kind {
        ResourceKind::Unknown(_) => None,
        ref k if k.is_status() => None,
        k => Some(k),
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let rx = state.snapshots.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

/// Pushes the current snapshot, then one per change, until either side goes.
async fn handle_socket(mut socket: WebSocket, mut rx: watch::Receiver<StatusSnapshot>) {
    let mut pending = true;

    loop {
        if pending {
            let payload = serde_json::to_string(&*rx.borrow_and_update());
            match payload {
                Ok(payload) => {
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "status snapshot not serializable"),
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                pending = true;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => pending = false,
                }
            }
        }
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Authorization header for API clients, query parameter for the browser.
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}
