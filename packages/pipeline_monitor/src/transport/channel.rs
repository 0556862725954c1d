//! ChannelTransport: the persistent push connection.
//!
//! `connect()` dials once and, on success, hands the link to a supervisor
//! task. The supervisor pumps frames in both directions until the link
//! drops, then walks the backoff schedule until a dial succeeds again or the
//! channel is explicitly closed. One supervisor exists per connect call; a
//! `disconnect()` cancels it.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected ──link lost──► Reconnecting{n}
//!      ▲                        │                  ▲                         │
//!      │                        └──err──► Failed   └──────────dial ok────────┘
//!      └──────────────── disconnect (from any state) ◄───────────────────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffSchedule;
use super::dialer::{CredentialProvider, Dialer, Link};
use crate::config::TransportFileConfig;
use crate::error::ChannelError;
use crate::model::{ConnectionState, ConnectionStatus};
use crate::protocol::ClientMessage;

const EVENT_BUFFER: usize = 256;

/// Inbound traffic and link lifecycle, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// The link dropped and the reconnect loop has started
    ConnectionLost { reason: String },
    /// A reconnect attempt succeeded; `attempts` counts dials since the loss
    Reconnected { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub backoff: BackoffSchedule,
    /// `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
}

impl TransportSettings {
    pub fn from_file(file: &TransportFileConfig) -> Self {
        Self {
            backoff: BackoffSchedule::from_millis(&file.backoff_ms),
            heartbeat_interval: (file.heartbeat_interval_secs > 0)
                .then(|| Duration::from_secs(file.heartbeat_interval_secs)),
            connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            outbound_capacity: file.outbound_capacity.max(1),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from_file(&TransportFileConfig::default())
    }
}

/// Anything control messages can be written to. Implemented by the transport
/// and by recording fakes in tests.
pub trait Outbound {
    fn state(&self) -> ConnectionState;

    fn send_frame(&self, frame: String) -> Result<(), ChannelError>;

    fn send_message(&self, message: &ClientMessage) -> Result<(), ChannelError> {
        let frame = message
            .to_frame()
            .map_err(|e| ChannelError::Transport(format!("failed to encode message: {e}")))?;
        self.send_frame(frame)
    }
}

struct LinkSlot {
    /// Writer side of the live link, present only while connected
    outbound: Option<mpsc::Sender<String>>,
    /// Cancels the supervisor started by the last `connect()`
    session: CancellationToken,
    /// Bumped per installed link so a stale pump cannot clear a newer writer
    generation: u64,
}

struct Shared<D> {
    dialer: D,
    url: String,
    credentials: Arc<dyn CredentialProvider>,
    settings: TransportSettings,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::Sender<TransportEvent>,
    slot: Mutex<LinkSlot>,
}

pub struct ChannelTransport<D: Dialer> {
    shared: Arc<Shared<D>>,
}

impl<D: Dialer> ChannelTransport<D> {
    pub fn new(
        dialer: D,
        url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        settings: TransportSettings,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status, _) = watch::channel(ConnectionStatus::default());
        let session = CancellationToken::new();
        session.cancel();

        let shared = Arc::new(Shared {
            dialer,
            url: url.into(),
            credentials,
            settings,
            status,
            events,
            slot: Mutex::new(LinkSlot {
                outbound: None,
                session,
                generation: 0,
            }),
        });
        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.shared.settings
    }

    /// Open the channel. A no-op while connecting, connected or reconnecting.
    /// On failure the state becomes `Failed` and the error is also recorded
    /// in the status.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let Some(session) = self.shared.claim_session() else {
            debug!(state = %self.state(), "connect ignored, channel already active");
            return Ok(());
        };
        info!(url = %self.shared.url, "connecting push channel");

        let link = match self.shared.dial().await {
            Ok(link) => link,
            Err(e) => {
                warn!(url = %self.shared.url, error = %e, "push channel connect failed");
                self.shared
                    .set_status(&session, ConnectionState::Failed, Some(e.to_string()));
                return Err(e);
            }
        };

        // A disconnect() may have raced the dial; the status already says so.
        let Some((outbound, generation)) = self.shared.install(&session) else {
            debug!("connect superseded by disconnect");
            return Ok(());
        };
        info!(url = %self.shared.url, "push channel connected");

        let shared = self.shared.clone();
        tokio::spawn(supervise(shared, link, outbound, generation, session));
        Ok(())
    }

    /// Close the channel and stop any reconnect loop. Idempotent.
    pub fn disconnect(&self) {
        self.shared.close(None);
    }

    /// The credential is no longer valid: close without reconnecting and
    /// leave the reason in the status.
    pub fn on_credential_expired(&self) {
        info!(url = %self.shared.url, "credential expired, closing push channel");
        self.shared.close(Some("credential expired".to_string()));
    }

    /// Queue one text frame. Fails fast when not connected or when the
    /// outbound buffer is full; nothing is queued across a reconnect.
    pub fn send(&self, frame: String) -> Result<(), ChannelError> {
        if !self.state().is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let slot = self.shared.lock_slot();
        let Some(tx) = &slot.outbound else {
            return Err(ChannelError::NotConnected);
        };
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Transport("outbound buffer full".to_string()),
            TrySendError::Closed(_) => ChannelError::NotConnected,
        })
    }
}

impl<D: Dialer> Outbound for ChannelTransport<D> {
    fn state(&self) -> ConnectionState {
        ChannelTransport::state(self)
    }

    fn send_frame(&self, frame: String) -> Result<(), ChannelError> {
        self.send(frame)
    }
}

impl<D: Dialer> Drop for ChannelTransport<D> {
    fn drop(&mut self) {
        self.shared.close(None);
    }
}

impl<D: Dialer> Shared<D> {
    fn lock_slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move Disconnected/Failed to Connecting and hand out a fresh session
    /// token, cancelling any previous supervisor. Both happen under the slot
    /// lock, so a `close()` either lands before the claim or cancels the new
    /// token. `None` when the channel is already active.
    fn claim_session(&self) -> Option<CancellationToken> {
        let mut slot = self.lock_slot();
        let claimed = self.status.send_if_modified(|status| {
            if matches!(
                status.state,
                ConnectionState::Disconnected | ConnectionState::Failed
            ) {
                status.state = ConnectionState::Connecting;
                status.error = None;
                true
            } else {
                false
            }
        });
        if !claimed {
            return None;
        }
        slot.session.cancel();
        slot.session = CancellationToken::new();
        Some(slot.session.clone())
    }

    async fn dial(&self) -> Result<Link, ChannelError> {
        let credential = self
            .credentials
            .credential()
            .ok_or(ChannelError::AuthUnavailable)?;
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, self.dialer.dial(&self.url, &credential)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Transport(format!(
                "connect timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Publish a new writer and flip to Connected, unless the session was
    /// cancelled meanwhile. Both happen under the slot lock so `send()` never
    /// observes Connected without a writer.
    fn install(&self, session: &CancellationToken) -> Option<(mpsc::Receiver<String>, u64)> {
        let mut slot = self.lock_slot();
        if session.is_cancelled() {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.settings.outbound_capacity);
        slot.generation += 1;
        slot.outbound = Some(tx);
        self.status.send_replace(ConnectionStatus {
            state: ConnectionState::Connected,
            error: None,
        });
        Some((rx, slot.generation))
    }

    fn release(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot.generation == generation {
            slot.outbound = None;
        }
    }

    /// Update the status on behalf of a supervisor. Returns false (and does
    /// nothing) once the session has been cancelled.
    fn set_status(
        &self,
        session: &CancellationToken,
        state: ConnectionState,
        error: Option<String>,
    ) -> bool {
        let _slot = self.lock_slot();
        if session.is_cancelled() {
            return false;
        }
        self.status.send_replace(ConnectionStatus { state, error });
        true
    }

    fn close(&self, error: Option<String>) {
        let mut slot = self.lock_slot();
        slot.session.cancel();
        slot.outbound = None;
        let next = ConnectionStatus {
            state: ConnectionState::Disconnected,
            error,
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }
}

async fn supervise<D: Dialer>(
    shared: Arc<Shared<D>>,
    mut link: Link,
    mut outbound: mpsc::Receiver<String>,
    mut generation: u64,
    session: CancellationToken,
) {
    loop {
        let reason = pump(&shared, link, &mut outbound, &session).await;
        shared.release(generation);
        if session.is_cancelled() {
            debug!(url = %shared.url, "push channel closed");
            return;
        }

        warn!(url = %shared.url, error = %reason, "push channel lost, will reconnect");
        let reason = reason.to_string();
        if !shared.set_status(
            &session,
            ConnectionState::Reconnecting { attempt: 0 },
            Some(reason.clone()),
        ) {
            return;
        }
        let _ = shared
            .events
            .send(TransportEvent::ConnectionLost { reason })
            .await;

        let Some((new_link, new_outbound, new_generation, attempts)) =
            reconnect(&shared, &session).await
        else {
            return;
        };
        info!(url = %shared.url, attempts, "push channel reconnected");
        link = new_link;
        outbound = new_outbound;
        generation = new_generation;
        let _ = shared
            .events
            .send(TransportEvent::Reconnected { attempts })
            .await;
    }
}

/// Move frames until the link ends. Returns why it ended.
async fn pump<D: Dialer>(
    shared: &Shared<D>,
    link: Link,
    outbound: &mut mpsc::Receiver<String>,
    session: &CancellationToken,
) -> ChannelError {
    let Link {
        mut sink,
        mut stream,
    } = link;

    loop {
        tokio::select! {
            _ = session.cancelled() => {
                let _ = sink.close().await;
                return ChannelError::NotConnected;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Writer withdrawn by close()
                    let _ = sink.close().await;
                    return ChannelError::NotConnected;
                };
                if let Err(e) = sink.send(frame).await {
                    return e;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => {
                    if shared.events.send(TransportEvent::Frame(text)).await.is_err() {
                        debug!("event consumer gone, stopping push channel");
                        session.cancel();
                        let _ = sink.close().await;
                        return ChannelError::NotConnected;
                    }
                }
                Some(Err(e)) => return e,
                None => return ChannelError::Transport("connection closed by server".to_string()),
            }
        }
    }
}

async fn reconnect<D: Dialer>(
    shared: &Shared<D>,
    session: &CancellationToken,
) -> Option<(Link, mpsc::Receiver<String>, u64, u32)> {
    let mut attempt = 0u32;
    loop {
        let delay = shared.settings.backoff.delay(attempt);
        tokio::select! {
            _ = session.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        let last_error = shared.status.borrow().error.clone();
        if !shared.set_status(
            session,
            ConnectionState::Reconnecting { attempt },
            last_error,
        ) {
            return None;
        }
        info!(url = %shared.url, attempt, "reconnection attempt");

        let result = tokio::select! {
            _ = session.cancelled() => return None,
            result = shared.dial() => result,
        };

        match result {
            Ok(link) => {
                let (outbound, generation) = shared.install(session)?;
                return Some((link, outbound, generation, attempt));
            }
            Err(e) if !e.is_retryable() => {
                warn!(url = %shared.url, attempt, error = %e, "giving up on reconnect");
                shared.set_status(session, ConnectionState::Failed, Some(e.to_string()));
                return None;
            }
            Err(e) => {
                warn!(url = %shared.url, attempt, error = %e, "reconnect failed");
                shared.set_status(
                    session,
                    ConnectionState::Reconnecting { attempt },
                    Some(e.to_string()),
                );
            }
        }
    }
}
