use std::future::Future;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::SessionError;
use crate::negotiation::NegotiatorEvent;
use crate::relay::RelayEvent;
use crate::session::{LocalKey, NegotiationSession, RemoteKey, SessionSnapshot, SessionState};

enum Command {
    Register(oneshot::Sender<Result<(), SessionError>>),
    Connect(String, oneshot::Sender<Result<(), SessionError>>),
    Close(oneshot::Sender<Result<(), SessionError>>),
}

/// Runs a [`NegotiationSession`] on its own task.
pub struct SessionDriver;

impl SessionDriver {
    pub fn spawn(
        session: NegotiationSession,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        negotiator_events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let remote_key = session.remote_key();
        let local_key = session.local_key();
        let task = tokio::spawn(run(
            session,
            commands_rx,
            relay_events,
            negotiator_events,
            snapshot_tx,
        ));
        SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            remote_key,
            local_key,
            task,
        }
    }
}

async fn run(
    mut session: NegotiationSession,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    mut negotiator_events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
) {
    let mut relay_open = true;
    let mut negotiator_open = true;

    loop {
        let deadline = session.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Register(reply) => {
                        let result = session.register().await;
                        publish(&snapshot_tx, &session);
                        let _ = reply.send(result);
                    }
                    Command::Connect(target, reply) => {
                        let result = session.connect_target(&target).await;
                        publish(&snapshot_tx, &session);
                        let _ = reply.send(result);
                    }
                    Command::Close(reply) => {
                        let result = session.close().await;
                        publish(&snapshot_tx, &session);
                        let _ = reply.send(result);
                    }
                }
            }
            event = relay_events.recv(), if relay_open => {
                let event = event.unwrap_or(RelayEvent::Disconnected);
                if event == RelayEvent::Disconnected {
                    relay_open = false;
                }
                if let Err(err) = session.handle_relay_event(event).await {
                    session.report_failure(err);
                }
            }
            event = negotiator_events.recv(), if negotiator_open => {
                match event {
                    Some(event) => {
                        if let Err(err) = session.handle_negotiator_event(event).await {
                            session.report_failure(err);
                        }
                    }
                    None => negotiator_open = false,
                }
            }
            _ = wait_for_deadline(deadline) => {
                if let Err(err) = session.on_deadline(Instant::now()).await {
                    session.report_failure(err);
                }
            }
        }
        publish(&snapshot_tx, &session);
    }
    tracing::debug!(target = "peer_link::session", "session driver stopped");
}

fn publish(snapshot_tx: &watch::Sender<SessionSnapshot>, session: &NegotiationSession) {
    let next = session.snapshot();
    snapshot_tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

fn wait_for_deadline(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

/// Caller-facing side of a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    remote_key: RemoteKey,
    local_key: LocalKey,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn register(&self) -> Result<(), SessionError> {
        self.request(Command::Register).await
    }

    /// Registers and waits for the relay to assign a client id.
    pub async fn register_and_wait(&self) -> Result<String, SessionError> {
        self.register().await?;
        let snapshot = self
            .wait_for_state(|state| state != SessionState::Registering)
            .await?;
        match snapshot.state {
            SessionState::Unregistered => Err(SessionError::Timeout("registration")),
            SessionState::Closed => Err(SessionError::RelayDisconnected),
            state => snapshot.client_id.ok_or(SessionError::NotRegistered(state)),
        }
    }

    pub async fn connect_target(&self, target_id: impl Into<String>) -> Result<(), SessionError> {
        let target_id = target_id.into();
        self.request(|reply| Command::Connect(target_id, reply)).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(Command::Close).await
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Resolves with the first snapshot whose state satisfies `predicate`.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(SessionState) -> bool,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut rx = self.snapshot.clone();
        let snapshot = (*rx
            .wait_for(|snapshot| predicate(snapshot.state))
            .await
            .map_err(|_| SessionError::DriverStopped)?)
        .clone();
        Ok(snapshot)
    }

    pub fn remote_key(&self) -> RemoteKey {
        self.remote_key.clone()
    }

    pub fn local_key(&self) -> LocalKey {
        self.local_key.clone()
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| SessionError::DriverStopped)?;
        reply_rx.await.map_err(|_| SessionError::DriverStopped)?
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
