use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use iris_types::{
    protocol::{InboundMessage, OutboundMessage},
    state::ConnectionState,
    Result,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::sleep,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{channel_error, BackoffPolicy, Connector, Link};

const OUTBOUND_CAPACITY: usize = 4;
const INBOUND_CAPACITY: usize = 64;

/// Persistent connection to the inference service.
///
/// A background supervisor walks the `Disconnected -> Connecting -> Connected`
/// cycle, reconnecting with the configured backoff whenever the link drops.
/// Messages queued while the link is down are discarded, never replayed.
pub struct TransportChannel {
    state: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    sessions: watch::Receiver<u64>,
    outbound: mpsc::Sender<OutboundMessage>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TransportChannel {
    /// Spawns the supervisor and returns the channel plus its inbound stream.
    pub fn connect(
        url: impl Into<String>,
        client_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        backoff: Box<dyn BackoffPolicy>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state_tx);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sessions_tx, sessions_rx) = watch::channel(0);

        let supervisor = Supervisor {
            url: url.into(),
            client_id: client_id.into(),
            connector,
            backoff,
            state: state.clone(),
            sessions: sessions_tx,
            outbound: outbound_rx,
            inbound: inbound_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        let channel = Self {
            state,
            state_rx,
            sessions: sessions_rx,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        };
        (channel, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Number of links established so far. Bumped before each `Connected`.
    pub fn session(&self) -> u64 {
        *self.sessions.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn state_changes(&self) -> BoxStream<'static, ConnectionState> {
        WatchStream::new(self.state_rx.clone()).boxed()
    }

    /// Fire-and-forget send. Fails immediately unless connected.
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        if !self.state().is_connected() {
            return Err(channel_error("not connected"));
        }
        self.outbound.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => channel_error("outbound queue full"),
            TrySendError::Closed(_) => channel_error("channel closed"),
        })
    }

    /// Stops the supervisor; no reconnection is attempted afterwards. Idempotent.
    pub fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Transport channel closed");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum PumpExit {
    Shutdown,
    Dropped(String),
}

struct Supervisor {
    url: String,
    client_id: String,
    connector: Arc<dyn Connector>,
    backoff: Box<dyn BackoffPolicy>,
    state: Arc<watch::Sender<ConnectionState>>,
    sessions: watch::Sender<u64>,
    outbound: mpsc::Receiver<OutboundMessage>,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.transition(ConnectionState::Connecting);

            let connector = self.connector.clone();
            let connected = tokio::select! {
                result = connector.connect(&self.url) => result,
                _ = self.shutdown.changed() => break,
            };

            match connected {
                Ok(link) => {
                    attempt = 0;
                    self.sessions.send_modify(|session| *session += 1);
                    self.transition(ConnectionState::Connected);
                    match self.pump(link).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Dropped(reason) => {
                            warn!("Connection to {} lost: {}", self.url, reason)
                        }
                    }
                }
                Err(err) => warn!(
                    "Connect attempt {} to {} failed: {err}",
                    attempt + 1,
                    self.url
                ),
            }

            self.transition(ConnectionState::Disconnected);
            let discarded = self.discard_queued();
            if discarded > 0 {
                debug!("Discarded {} queued messages after disconnect", discarded);
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!("Reconnecting to {} in {}ms", self.url, delay.as_millis());
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.transition(ConnectionState::Disconnected);
    }

    async fn pump(&mut self, mut link: Link) -> PumpExit {
        let handshake = OutboundMessage::Connect {
            client_id: self.client_id.clone(),
        };
        match handshake.to_text() {
            Ok(text) => {
                if link.outbound.send(text).await.is_err() {
                    return PumpExit::Dropped("handshake rejected".into());
                }
            }
            Err(err) => return PumpExit::Dropped(err.to_string()),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return PumpExit::Shutdown,
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        return PumpExit::Shutdown;
                    };
                    match message.to_text() {
                        Ok(text) => {
                            if link.outbound.send(text).await.is_err() {
                                return PumpExit::Dropped("send failed".into());
                            }
                        }
                        Err(err) => warn!("Dropping outbound message: {err}"),
                    }
                }
                text = link.inbound.recv() => {
                    let Some(text) = text else {
                        return PumpExit::Dropped("remote closed".into());
                    };
                    match InboundMessage::decode(&text) {
                        Ok(message) => {
                            if self.inbound.send(message).await.is_err() {
                                return PumpExit::Shutdown;
                            }
                        }
                        Err(err) => warn!("Skipping inbound message: {err}"),
                    }
                }
            }
        }
    }

    fn discard_queued(&mut self) -> usize {
        let mut discarded = 0;
        while self.outbound.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    fn transition(&self, next: ConnectionState) {
        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            debug!("Unexpected transport transition {:?} -> {:?}", previous, next);
        }
        self.state.send_replace(next);
        info!("Transport {:?} -> {:?}", previous, next);
    }
}
