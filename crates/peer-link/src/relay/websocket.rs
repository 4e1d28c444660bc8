use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::{ClientMessage, Relay, RelayEvent, ServerMessage};
use crate::config::SessionConfig;
use crate::error::RelayError;

/// Relay reached over a WebSocket carrying one JSON frame per message.
pub struct WebSocketRelay {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebSocketRelay {
    /// Connects to `config.relay_url`.
    pub async fn from_config(
        config: &SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>), RelayError> {
        Self::connect(&config.relay_url).await
    }

    pub async fn connect(
        relay_url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>), RelayError> {
        let websocket_url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| RelayError::Connect(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "peer_link::relay", url = %websocket_url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<RelayEvent>();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "peer_link::relay", error = %err, "failed to encode relay frame");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "peer_link::relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "peer_link::relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "peer_link::relay", event = "ws_in", len = text.len());
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if events_tx.send(RelayEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "peer_link::relay", error = %err, "dropping unparseable relay frame");
                    }
                }
            }
            let _ = events_tx.send(RelayEvent::Disconnected);
        });

        let relay = Arc::new(Self {
            send_tx,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        });
        Ok((relay, events_rx))
    }
}

impl Relay for WebSocketRelay {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.send_tx.send(message).map_err(|_| RelayError::Closed)
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn derive_websocket_url(relay_url: &str) -> Result<Url, RelayError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| RelayError::Connect(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RelayError::Connect(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Connect("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
