//! PipelineMonitor: the surface a UI binds to.
//!
//! The monitor owns the transport and one actor task. The actor owns the
//! session registry and the progress reconciler, so every event and every
//! control command is applied in a single total order. Readers never lock
//! anything: they read the latest `MonitorSnapshot` from a watch channel.
//!
//! ```text
//!   push link ──► ChannelTransport ──TransportEvent──┐
//!                                                    ▼
//!   join/leave/begin_job ──MonitorCommand──► MonitorActor ──send_replace──► watch<MonitorSnapshot>
//!                                          (registry + reconciler)                   │
//!   batch call ──► await_reconciled_result ◄── ResultMerger::settle ◄────────────────┘
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::client::{PipelineClient, PipelineTestRequest};
use crate::config::MonitorConfig;
use crate::error::{ChannelError, MonitorError, RegistryError};
use crate::merger::{LiveView, MergeSettings, ReconciledResult, ResultMerger};
use crate::model::{
    BatchResult, ConnectionState, ConnectionStatus, Session, StepProgress,
};
use crate::protocol::{ClientMessage, ServerEvent, decode_event};
use crate::reconciler::{Applied, IgnoreReason, ProgressReconciler};
use crate::registry::{JoinOutcome, LeaveOutcome, SessionRegistry, Subscription};
use crate::transport::{
    ChannelTransport, CredentialProvider, Dialer, Outbound, TransportEvent, WsDialer,
};

const COMMAND_BUFFER: usize = 32;

/// Counters over every inbound frame since the monitor started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub applied: u64,
    pub ignored: u64,
    pub malformed: u64,
}

/// Everything a UI renders besides the connection status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub session: Option<Session>,
    pub steps: BTreeMap<String, StepProgress>,
    #[serde(skip)]
    pub subscription: Option<Subscription>,
    pub stats: IngestStats,
    pub last_heartbeat_ack: Option<DateTime<Utc>>,
}

impl MonitorSnapshot {
    /// Mean progress over the requested steps (or every known step when the
    /// run did not announce any). Finished steps count as 100.
    pub fn overall_percent(&self) -> u8 {
        let names: Vec<&str> = match &self.session {
            Some(session) if !session.requested_steps.is_empty() => {
                session.requested_steps.iter().map(String::as_str).collect()
            }
            _ => self.steps.keys().map(String::as_str).collect(),
        };
        if names.is_empty() {
            return 0;
        }

        let total: u32 = names
            .iter()
            .map(|name| match self.steps.get(*name) {
                Some(step) if step.is_terminal() => 100,
                Some(step) => u32::from(step.progress_percent),
                None => 0,
            })
            .sum();
        let mean = (f64::from(total) / names.len() as f64).round();
        mean.clamp(0.0, 100.0) as u8
    }

    /// Steps in requested order, then any unrequested steps seen in telemetry.
    pub fn ordered_steps(&self) -> Vec<(&str, &StepProgress)> {
        let requested: &[String] = self
            .session
            .as_ref()
            .map(|s| s.requested_steps.as_slice())
            .unwrap_or_default();

        let mut ordered: Vec<(&str, &StepProgress)> = requested
            .iter()
            .filter_map(|name| self.steps.get(name).map(|step| (name.as_str(), step)))
            .collect();
        ordered.extend(
            self.steps
                .iter()
                .filter(|(name, _)| !requested.contains(*name))
                .map(|(name, step)| (name.as_str(), step)),
        );
        ordered
    }
}

impl LiveView for MonitorSnapshot {
    fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn steps(&self) -> &BTreeMap<String, StepProgress> {
        &self.steps
    }
}

/// Commands routed through the actor
#[derive(Debug)]
enum MonitorCommand {
    Join {
        test_id: String,
        respond_to: oneshot::Sender<Result<JoinOutcome, RegistryError>>,
    },
    Leave {
        test_id: String,
        respond_to: oneshot::Sender<Result<LeaveOutcome, RegistryError>>,
    },
    /// Reset the view and watch a new test id
    BeginJob {
        test_id: String,
        respond_to: oneshot::Sender<()>,
    },
    ClearSession {
        respond_to: oneshot::Sender<()>,
    },
}

pub struct PipelineMonitor<D: Dialer = WsDialer> {
    transport: Arc<ChannelTransport<D>>,
    commands: mpsc::Sender<MonitorCommand>,
    view: watch::Receiver<MonitorSnapshot>,
    merge: MergeSettings,
    /// Result of the last merge, reused while the same test is in view
    last_result: Mutex<Option<ReconciledResult>>,
}

impl PipelineMonitor<WsDialer> {
    /// Monitor over a websocket push channel. Must be called inside a tokio
    /// runtime; the actor task is spawned immediately.
    pub fn new(config: &MonitorConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_dialer(WsDialer, config, credentials)
    }
}

impl<D: Dialer> PipelineMonitor<D> {
    pub fn with_dialer(
        dialer: D,
        config: &MonitorConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (transport, events) = ChannelTransport::new(
            dialer,
            config.push_url.clone(),
            credentials,
            config.transport.clone(),
        );
        let transport = Arc::new(transport);
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view) = watch::channel(MonitorSnapshot::default());

        let actor = MonitorActor {
            status: transport.subscribe_status(),
            transport: transport.clone(),
            registry: SessionRegistry::new(),
            reconciler: ProgressReconciler::new(),
            stats: IngestStats::default(),
            last_heartbeat_ack: None,
            view: view_tx,
        };
        tokio::spawn(actor.run(commands_rx, events, config.transport.heartbeat_interval));

        Self {
            transport,
            commands,
            view,
            merge: config.merge,
            last_result: Mutex::new(None),
        }
    }

    // === Connection ===

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn connection_error(&self) -> Option<String> {
        self.transport.status().error
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.subscribe_status()
    }

    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.transport.connect().await
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Close the channel because the credential is no longer valid.
    pub fn credential_expired(&self) {
        self.transport.on_credential_expired();
    }

    /// Fire-and-forget liveness ping. Only valid while connected.
    pub fn send_heartbeat(&self) -> Result<(), ChannelError> {
        self.transport.send_message(&ClientMessage::Heartbeat {
            timestamp: Utc::now(),
        })
    }

    // === Live view ===

    pub fn current_session(&self) -> Option<Session> {
        self.view.borrow().session.clone()
    }

    pub fn step_progress(&self) -> BTreeMap<String, StepProgress> {
        self.view.borrow().steps.clone()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.view.clone()
    }

    // === Subscriptions ===

    pub async fn join_session(&self, test_id: &str) -> Result<JoinOutcome, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(MonitorCommand::Join {
            test_id: test_id.to_string(),
            respond_to: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| MonitorError::ActorGone)??)
    }

    pub async fn leave_session(&self, test_id: &str) -> Result<LeaveOutcome, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(MonitorCommand::Leave {
            test_id: test_id.to_string(),
            respond_to: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| MonitorError::ActorGone)??)
    }

    /// Start tracking a new job: drop the previous session, step view and
    /// merged result, and ignore telemetry for any other test id.
    pub async fn begin_job(&self, test_id: &str) -> Result<(), MonitorError> {
        self.forget_result();
        let (tx, rx) = oneshot::channel();
        self.send_command(MonitorCommand::BeginJob {
            test_id: test_id.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| MonitorError::ActorGone)
    }

    pub async fn clear_session(&self) -> Result<(), MonitorError> {
        self.forget_result();
        let (tx, rx) = oneshot::channel();
        self.send_command(MonitorCommand::ClearSession { respond_to: tx })
            .await?;
        rx.await.map_err(|_| MonitorError::ActorGone)
    }

    // === Results ===

    /// Await the batch call, give trailing telemetry up to the grace window
    /// to land, then merge. The merge happens once per test; later calls for
    /// the same test get the cached result. Batch errors propagate untouched.
    pub async fn await_reconciled_result<F, E>(&self, batch: F) -> Result<ReconciledResult, E>
    where
        F: Future<Output = Result<BatchResult, E>>,
    {
        let batch = batch.await?;
        if let Some(cached) = self.cached_result() {
            debug!(test_id = ?cached.test_id, "reusing reconciled result");
            return Ok(cached);
        }

        let mut view = self.view.clone();
        let merged = ResultMerger::settle(&mut view, &batch, self.merge.grace_window).await;
        info!(
            test_id = ?merged.test_id,
            success = merged.success,
            steps = merged.steps.len(),
            telemetry_complete = merged.telemetry_complete,
            "pipeline result reconciled"
        );

        let mut last = self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match last.as_ref() {
            Some(existing) if existing.test_id.is_some() && existing.test_id == merged.test_id => {
                Ok(existing.clone())
            }
            _ => {
                *last = Some(merged.clone());
                Ok(merged)
            }
        }
    }

    /// Full flow for one run: reset the view, subscribe, make the batch
    /// call and merge. Live telemetry is best effort; when the push channel
    /// is unavailable the result is built from the batch response alone.
    pub async fn run_pipeline_test(
        &self,
        client: &PipelineClient,
        request: PipelineTestRequest,
    ) -> Result<ReconciledResult, MonitorError> {
        let test_id = request.test_id.clone();
        self.begin_job(&test_id).await?;

        if !self.connection_state().is_connected() {
            if let Err(e) = self.connect().await {
                warn!(test_id = %test_id, error = %e, "continuing without live telemetry");
            }
        }
        match self.join_session(&test_id).await {
            Ok(_) => {}
            Err(MonitorError::Registry(e)) => {
                warn!(test_id = %test_id, error = %e, "continuing without live telemetry");
            }
            Err(e) => return Err(e),
        }

        let result = self
            .await_reconciled_result(client.run_pipeline_test(&request))
            .await?;
        Ok(result)
    }

    async fn send_command(&self, command: MonitorCommand) -> Result<(), MonitorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MonitorError::ActorGone)
    }

    fn cached_result(&self) -> Option<ReconciledResult> {
        let current = self
            .view
            .borrow()
            .session
            .as_ref()
            .map(|s| s.test_id.clone())?;
        let last = self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.as_ref()
            .filter(|r| r.test_id.as_deref() == Some(current.as_str()))
            .cloned()
    }

    fn forget_result(&self) {
        *self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<D: Dialer> Drop for PipelineMonitor<D> {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}

struct MonitorActor<D: Dialer> {
    transport: Arc<ChannelTransport<D>>,
    status: watch::Receiver<ConnectionStatus>,
    registry: SessionRegistry,
    reconciler: ProgressReconciler,
    stats: IngestStats,
    last_heartbeat_ack: Option<DateTime<Utc>>,
    view: watch::Sender<MonitorSnapshot>,
}

impl<D: Dialer> MonitorActor<D> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<MonitorCommand>,
        mut events: mpsc::Receiver<TransportEvent>,
        heartbeat: Option<Duration>,
    ) {
        let mut heartbeat = heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_transport(event),
                    None => break,
                },
                changed = self.status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.handle_status();
                }
                _ = tick(&mut heartbeat) => self.send_heartbeat(),
            }
        }
        debug!("monitor actor stopped");
    }

    fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Join {
                test_id,
                respond_to,
            } => {
                let result = self.registry.join(self.transport.as_ref(), &test_id);
                if matches!(result, Ok(JoinOutcome::Sent)) && !self.tracks(&test_id) {
                    debug!(test_id = %test_id, "switching live view to joined test");
                    self.reconciler.begin(&test_id);
                }
                self.publish();
                let _ = respond_to.send(result);
            }
            MonitorCommand::Leave {
                test_id,
                respond_to,
            } => {
                let result = self.registry.leave(self.transport.as_ref(), &test_id);
                self.publish();
                let _ = respond_to.send(result);
            }
            MonitorCommand::BeginJob {
                test_id,
                respond_to,
            } => {
                info!(test_id = %test_id, "beginning job");
                self.reconciler.begin(&test_id);
                self.publish();
                let _ = respond_to.send(());
            }
            MonitorCommand::ClearSession { respond_to } => {
                self.reconciler.clear();
                self.reconciler.watch(None);
                self.publish();
                let _ = respond_to.send(());
            }
        }
    }

    fn tracks(&self, test_id: &str) -> bool {
        let tracked = self
            .reconciler
            .watched()
            .or(self.reconciler.session().map(|s| s.test_id.as_str()));
        tracked == Some(test_id)
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.ingest(&frame),
            TransportEvent::ConnectionLost { reason } => {
                debug!(%reason, "connection lost, subscription needs rejoin");
                self.registry.on_connection_lost();
                self.publish();
            }
            TransportEvent::Reconnected { attempts } => {
                debug!(attempts, "connection restored");
                self.rejoin();
            }
        }
    }

    /// Explicit disconnects and fresh connects do not produce transport
    /// events, so the status watch covers them.
    fn handle_status(&mut self) {
        let state = self.status.borrow_and_update().state;
        if state.is_connected() {
            self.rejoin();
        } else if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            self.registry.on_connection_lost();
            self.publish();
        }
    }

    fn rejoin(&mut self) {
        if let Err(e) = self.registry.on_reconnected(self.transport.as_ref()) {
            warn!(error = %e, code = e.error_code(), "failed to rejoin session");
        }
        self.publish();
    }

    fn send_heartbeat(&mut self) {
        if !self.transport.state().is_connected() {
            return;
        }
        let message = ClientMessage::Heartbeat {
            timestamp: Utc::now(),
        };
        match self.transport.send_message(&message) {
            Ok(()) => trace!("heartbeat sent"),
            Err(e) => debug!(error = %e, "heartbeat not sent"),
        }
    }

    fn ingest(&mut self, frame: &str) {
        self.stats.received += 1;
        let now = Utc::now();

        let outcome = decode_event(frame).and_then(|event| match event {
            ServerEvent::SessionJoined { test_id, timestamp } => {
                let at = timestamp.unwrap_or(now);
                if self.registry.on_joined(&test_id, at) {
                    self.reconciler.seed_waiting(&test_id, at);
                    Ok(Applied::Updated)
                } else {
                    Ok(Applied::Ignored(IgnoreReason::ForeignTest))
                }
            }
            ServerEvent::SessionLeft { test_id, .. } => {
                self.registry.on_left(&test_id);
                Ok(Applied::Updated)
            }
            ServerEvent::HeartbeatAck { timestamp } => {
                trace!("heartbeat acknowledged");
                self.last_heartbeat_ack = Some(timestamp.unwrap_or(now));
                Ok(Applied::Updated)
            }
            other => self.reconciler.apply(other, now),
        });

        match outcome {
            Ok(Applied::Updated) => self.stats.applied += 1,
            Ok(Applied::Ignored(reason)) => {
                debug!(?reason, "push event ignored");
                self.stats.ignored += 1;
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "dropping malformed push event");
                self.stats.malformed += 1;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.view.send_replace(MonitorSnapshot {
            session: self.reconciler.session().cloned(),
            steps: self.reconciler.steps().clone(),
            subscription: self.registry.current().cloned(),
            stats: self.stats,
            last_heartbeat_ack: self.last_heartbeat_ack,
        });
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
