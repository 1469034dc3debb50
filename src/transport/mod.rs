use crate::connection::{
    ChannelEvents, Connector, TransportCommand, TransportEvent, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const NO_STATUS_RECEIVED: u16 = 1005;

/// Websocket transport. Each connect spawns one task that owns the socket
/// for its whole life and reports back through `ChannelEvents`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: Url, events: ChannelEvents) -> mpsc::UnboundedSender<TransportCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            let (code, reason) = run_socket(url, &events, rx, connect_timeout).await;
            tracing::debug!(generation = events.generation(), code, reason = %reason, "push socket finished");
            events.emit(TransportEvent::Closed { code, reason });
        });
        tx
    }
}

async fn run_socket(
    url: Url,
    events: &ChannelEvents,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    connect_timeout: Duration,
) -> (u16, String) {
    let connect =
        tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await;
    let socket = match connect {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => {
            let reason = format!("connect failed: {err}");
            events.emit(TransportEvent::Error(reason.clone()));
            return (ABNORMAL_CLOSURE, reason);
        }
        Err(_) => {
            let reason = "connect timed out".to_string();
            events.emit(TransportEvent::Error(reason.clone()));
            return (ABNORMAL_CLOSURE, reason);
        }
    };
    events.emit(TransportEvent::Opened);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::Send(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        let reason = format!("send failed: {err}");
                        events.emit(TransportEvent::Error(reason.clone()));
                        return (ABNORMAL_CLOSURE, reason);
                    }
                }
                Some(TransportCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return (code, reason);
                }
                None => {
                    let _ = sink.close().await;
                    return (NORMAL_CLOSURE, "channel released".to_string());
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    events.emit(TransportEvent::Frame(text));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        events.emit(TransportEvent::Frame(text));
                    }
                    Err(_) => tracing::debug!("non-utf8 binary frame ignored"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let reason = format!("read failed: {err}");
                    events.emit(TransportEvent::Error(reason.clone()));
                    return (ABNORMAL_CLOSURE, reason);
                }
                None => return (ABNORMAL_CLOSURE, "stream ended".to_string()),
            }
        }
    }
}
