use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ClientMessage, Relay, RelayEvent, ServerMessage};
use crate::error::RelayError;

#[derive(Debug)]
struct Connection {
    events: mpsc::UnboundedSender<RelayEvent>,
    client_id: Option<String>,
    requested_id: Option<String>,
}

/// In-process relay hub routing frames between connected clients by id.
#[derive(Debug, Default)]
pub struct LocalRelay {
    connections: RwLock<HashMap<u64, Connection>>,
    by_client: RwLock<HashMap<String, u64>>,
    next_connection: parking_lot::Mutex<u64>,
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connects a client that is assigned a random id on registration.
    pub fn connect(
        self: &Arc<Self>,
    ) -> (Arc<LocalRelayClient>, mpsc::UnboundedReceiver<RelayEvent>) {
        self.attach(None)
    }

    /// Connects a client that is assigned `client_id` on registration.
    pub fn connect_as(
        self: &Arc<Self>,
        client_id: impl Into<String>,
    ) -> (Arc<LocalRelayClient>, mpsc::UnboundedReceiver<RelayEvent>) {
        self.attach(Some(client_id.into()))
    }

    fn attach(
        self: &Arc<Self>,
        requested_id: Option<String>,
    ) -> (Arc<LocalRelayClient>, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = {
            let mut next = self.next_connection.lock();
            *next += 1;
            *next
        };
        self.connections.write().insert(
            connection_id,
            Connection {
                events: tx,
                client_id: None,
                requested_id,
            },
        );
        let client = Arc::new(LocalRelayClient {
            relay: Arc::clone(self),
            connection_id,
        });
        (client, rx)
    }

    /// Drops the client's connection and notifies it of the disconnect.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let Some(connection_id) = self.by_client.write().remove(client_id) else {
            return false;
        };
        if let Some(connection) = self.connections.write().remove(&connection_id) {
            let _ = connection.events.send(RelayEvent::Disconnected);
        }
        tracing::debug!(target = "peer_link::relay", client_id, "local relay dropped client");
        true
    }

    pub fn registered_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_client.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn route(&self, connection_id: u64, message: ClientMessage) -> Result<(), RelayError> {
        match message {
            ClientMessage::Register { public_key } => {
                let mut connections = self.connections.write();
                let connection = connections
                    .get_mut(&connection_id)
                    .ok_or(RelayError::Closed)?;
                if let Some(existing) = connection.client_id.clone() {
                    return Err(RelayError::Protocol(format!(
                        "connection already registered as {existing}"
                    )));
                }
                let client_id = connection
                    .requested_id
                    .take()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                connection.client_id = Some(client_id.clone());
                self.by_client
                    .write()
                    .insert(client_id.clone(), connection_id);
                tracing::debug!(
                    target = "peer_link::relay",
                    client_id = %client_id,
                    key_len = public_key.len(),
                    "local relay registered client"
                );
                connection
                    .events
                    .send(RelayEvent::Message(ServerMessage::Success { client_id }))
                    .map_err(|_| RelayError::Closed)
            }
            ClientMessage::Offer {
                description,
                from,
                to,
                public_key,
            } => self.deliver(
                &to,
                ServerMessage::Offer {
                    description,
                    from,
                    public_key,
                },
            ),
            ClientMessage::Answer {
                description,
                from,
                to,
                public_key,
            } => self.deliver(
                &to,
                ServerMessage::Answer {
                    description,
                    from,
                    public_key,
                },
            ),
            ClientMessage::Candidate { candidate, to } => {
                let from = self
                    .connections
                    .read()
                    .get(&connection_id)
                    .and_then(|connection| connection.client_id.clone());
                self.deliver(&to, ServerMessage::Candidate { candidate, from })
            }
        }
    }

    fn deliver(&self, to: &str, message: ServerMessage) -> Result<(), RelayError> {
        let connection_id = self.by_client.read().get(to).copied();
        let sender = connection_id.and_then(|id| {
            self.connections
                .read()
                .get(&id)
                .map(|connection| connection.events.clone())
        });
        match sender {
            Some(sender) => {
                if sender.send(RelayEvent::Message(message)).is_err() {
                    tracing::debug!(target = "peer_link::relay", to, "recipient stream closed; dropping frame");
                }
            }
            None => {
                tracing::warn!(target = "peer_link::relay", to, "no client registered under id; dropping frame");
            }
        }
        Ok(())
    }
}

pub struct LocalRelayClient {
    relay: Arc<LocalRelay>,
    connection_id: u64,
}

impl Relay for LocalRelayClient {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.relay.route(self.connection_id, message)
    }
}
