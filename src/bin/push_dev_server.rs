use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const DEFAULT_PORT: u16 = 8443;
const BROADCAST_CAPACITY: usize = 256;

/// One notification as typed on stdin.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct NotificationLine {
    object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireFrame {
    data: String,
}

/// Inbound control message from a console.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    id: String,
    #[serde(rename = "accountId", default)]
    account_id: Option<String>,
}

struct DevState {
    frames: broadcast::Sender<String>,
}

/// The inner record travels JSON-encoded inside the outer `data` string.
fn wrap(line: &NotificationLine) -> Result<String, serde_json::Error> {
    let frame = WireFrame {
        data: serde_json::to_string(line)?,
    };
    serde_json::to_string(&frame)
}

async fn ws_handler(
    State(state): State<Arc<DevState>>,
    ws: WebSocketUpgrade,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let account_id = query.get("accountId").cloned().unwrap_or_default();
    let has_token = query.get("token").is_some_and(|t| !t.is_empty());
    println!("+ console connected account={account_id} token={has_token}");
    let rx = state.frames.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, account_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<String>,
    mut account_id: String,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("! console {account_id} lagged, {skipped} frames skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ControlFrame>(&text) {
                        Ok(control) if control.id == "ACCOUNT_UPDATE" => {
                            let next = control.account_id.unwrap_or_default();
                            println!("<- ACCOUNT_UPDATE {account_id} -> {next}");
                            account_id = next;
                        }
                        Ok(control) => println!("<- {} account={account_id}", control.id),
                        Err(err) => eprintln!("! unreadable control message: {err}"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| f.code).unwrap_or(1005);
                    println!("- console {account_id} closed ({code})");
                    break;
                }
                None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }
}

async fn read_stdin(frames: broadcast::Sender<String>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let notification: NotificationLine = match serde_json::from_str(line) {
            Ok(notification) => notification,
            Err(err) => {
                eprintln!("! expected {{\"object\",\"method\",\"data\",\"message\"}}: {err}");
                continue;
            }
        };
        match wrap(&notification) {
            Ok(frame) => {
                let delivered = frames.send(frame).unwrap_or(0);
                println!("-> {} to {delivered} console(s)", notification.object);
            }
            Err(err) => eprintln!("! frame not encodable: {err}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = match std::env::args().nth(1) {
        Some(port) => port.parse()?,
        None => DEFAULT_PORT,
    };
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

    let (frames, _) = broadcast::channel(BROADCAST_CAPACITY);
    let state = Arc::new(DevState {
        frames: frames.clone(),
    });
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    println!("push-dev-server: ws://{addr}/ws, one notification JSON per stdin line");

    tokio::spawn(async move {
        if let Err(err) = read_stdin(frames).await {
            eprintln!("! stdin closed: {err}");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
