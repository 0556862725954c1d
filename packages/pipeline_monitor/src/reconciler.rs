//! Progress reconciler
//!
//! Folds step-lifecycle events into one `Session` and a `StepProgress` per
//! step. Events may arrive reordered, duplicated, or replayed after a
//! reconnect; the rules below keep the view monotonic under all of those:
//!
//! - a newer `TestStarted` replaces the session, an older or duplicate one is ignored
//! - `StepStarted` never regresses a terminal step
//! - `StepProgress` applies only while running and only if the percent does not go down
//! - `StepCompleted` / `StepError` always win
//!
//! The reconciler is plain data with `&mut self` methods. It must be driven
//! from a single owner (see `crate::monitor`), since the rules above are only
//! correct under a total order of application.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::MalformedEvent;
use crate::model::{Session, SessionStatus, StepProgress, StepStatus};
use crate::protocol::{ServerEvent, decode_event};

/// Why an event did not change the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event belongs to a test other than the one being watched
    ForeignTest,
    /// `TestStarted` not newer than the recorded session start
    StaleStart,
    /// Non-terminal event for a step already Completed/Error
    TerminalStep,
    /// Progress for a step that is not running
    NotRunning,
    /// Progress lower than what is already recorded
    StalePercent,
    /// Join/leave/heartbeat traffic
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    Ignored(IgnoreReason),
}

#[derive(Debug, Default)]
pub struct ProgressReconciler {
    session: Option<Session>,
    steps: BTreeMap<String, StepProgress>,
    watched: Option<String>,
}

impl ProgressReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn steps(&self) -> &BTreeMap<String, StepProgress> {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepProgress> {
        self.steps.get(name)
    }

    pub fn watched(&self) -> Option<&str> {
        self.watched.as_deref()
    }

    /// Scope ingestion to one test id. Events for other tests are ignored.
    pub fn watch(&mut self, test_id: Option<String>) {
        self.watched = test_id;
    }

    /// Drop the session and all step records.
    pub fn clear(&mut self) {
        self.session = None;
        self.steps.clear();
    }

    /// Start tracking a new job: clear everything and watch its test id.
    pub fn begin(&mut self, test_id: &str) {
        self.clear();
        self.watched = Some(test_id.to_string());
    }

    /// Seed a Waiting session after a join ack, unless a session already exists.
    /// Covers joining before the backend has announced the run.
    pub fn seed_waiting(&mut self, test_id: &str, joined_at: DateTime<Utc>) -> bool {
        if self.session.is_some() || !self.accepts(test_id) {
            return false;
        }
        self.session = Some(Session::waiting(test_id, joined_at));
        true
    }

    /// Decode and apply one raw frame.
    pub fn ingest(
        &mut self,
        frame: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Applied, MalformedEvent> {
        let event = decode_event(frame)?;
        self.apply(event, received_at)
    }

    /// Apply one decoded event. `received_at` stands in for missing timestamps.
    pub fn apply(
        &mut self,
        event: ServerEvent,
        received_at: DateTime<Utc>,
    ) -> Result<Applied, MalformedEvent> {
        if event.is_control() {
            return Ok(Applied::Ignored(IgnoreReason::Control));
        }
        // Unpinned, a new TestStarted may replace the finished or current run;
        // `test_started` orders it against the announced one.
        let unpinned_start =
            self.watched.is_none() && matches!(event, ServerEvent::TestStarted { .. });
        if let Some(test_id) = event.test_id().filter(|_| !unpinned_start) {
            if !self.accepts(test_id) {
                debug!(test_id, kind = event.kind(), "ignoring event for another test");
                return Ok(Applied::Ignored(IgnoreReason::ForeignTest));
            }
        }
        if let Some(step) = event.step_name() {
            self.check_step(event.test_id().unwrap_or_default(), step)?;
        }

        let applied = match event {
            ServerEvent::TestStarted {
                test_id,
                session_id,
                query,
                steps,
                start_time,
            } => self.test_started(
                test_id,
                session_id,
                query,
                steps,
                start_time.unwrap_or(received_at),
            ),
            ServerEvent::StepStarted {
                test_id,
                step_name,
                start_time,
            } => self.step_started(&test_id, step_name, start_time.unwrap_or(received_at)),
            ServerEvent::StepProgress {
                test_id,
                step_name,
                progress_percent,
                message,
            } => {
                let percent = clamp_percent(progress_percent)
                    .ok_or(MalformedEvent::InvalidPercent {
                        step: step_name.clone(),
                    })?;
                self.step_progress(&test_id, &step_name, percent, message, received_at)
            }
            ServerEvent::StepCompleted {
                test_id,
                step_name,
                end_time,
                start_time,
                details,
            } => self.step_finished(
                &test_id,
                step_name,
                StepStatus::Completed,
                end_time.unwrap_or(received_at),
                start_time,
                None,
                details,
            ),
            ServerEvent::StepError {
                test_id,
                step_name,
                end_time,
                message,
                details,
            } => self.step_finished(
                &test_id,
                step_name,
                StepStatus::Error,
                end_time.unwrap_or(received_at),
                None,
                message,
                details,
            ),
            ServerEvent::TestCompleted {
                test_id,
                end_time,
                result,
            } => self.test_finished(
                &test_id,
                SessionStatus::Completed,
                end_time.unwrap_or(received_at),
                None,
                result,
            ),
            ServerEvent::TestError {
                test_id,
                end_time,
                message,
                result,
            } => self.test_finished(
                &test_id,
                SessionStatus::Error,
                end_time.unwrap_or(received_at),
                message,
                result,
            ),
            ServerEvent::SessionJoined { .. }
            | ServerEvent::SessionLeft { .. }
            | ServerEvent::HeartbeatAck { .. } => Applied::Ignored(IgnoreReason::Control),
        };
        Ok(applied)
    }

    fn accepts(&self, test_id: &str) -> bool {
        let expected = self
            .watched
            .as_deref()
            .or(self.session.as_ref().map(|s| s.test_id.as_str()));
        expected.is_none_or(|expected| expected == test_id)
    }

    fn check_step(&self, test_id: &str, step: &str) -> Result<(), MalformedEvent> {
        let known = !step.trim().is_empty()
            && self.session.as_ref().is_none_or(|s| s.expects_step(step));
        if known {
            Ok(())
        } else {
            Err(MalformedEvent::UnknownStep {
                test_id: test_id.to_string(),
                step: step.to_string(),
            })
        }
    }

    /// Session for step/test events, created implicitly when telemetry
    /// arrives before any join ack or `TestStarted`.
    fn session_for(&mut self, test_id: &str, at: DateTime<Utc>) -> &mut Session {
        self.session.get_or_insert_with(|| {
            debug!(test_id, "creating session from step telemetry");
            let mut session = Session::waiting(test_id, at);
            session.status = SessionStatus::Running;
            session
        })
    }

    fn test_started(
        &mut self,
        test_id: String,
        session_id: Option<String>,
        query: String,
        steps: Vec<String>,
        start_time: DateTime<Utc>,
    ) -> Applied {
        if let Some(current) = &mut self.session {
            if current.announced {
                let duplicate = start_time == current.start_time && current.test_id == test_id;
                if start_time < current.start_time || duplicate {
                    debug!(%test_id, %start_time, "ignoring stale TestStarted");
                    return Applied::Ignored(IgnoreReason::StaleStart);
                }
            } else if current.test_id == test_id {
                // Seeded from a join ack or early telemetry: adopt it and keep
                // whatever step state already streamed in.
                current.session_id = session_id.unwrap_or_else(|| test_id.clone());
                current.query = query;
                current.start_time = start_time;
                if current.status == SessionStatus::Waiting {
                    current.status = SessionStatus::Running;
                }
                current.announced = true;
                for step in &steps {
                    self.steps.entry(step.clone()).or_default();
                }
                current.requested_steps = steps;
                return Applied::Updated;
            }
        }

        self.steps = steps
            .iter()
            .map(|step| (step.clone(), StepProgress::pending()))
            .collect();
        self.session = Some(Session {
            session_id: session_id.unwrap_or_else(|| test_id.clone()),
            test_id,
            query,
            requested_steps: steps,
            status: SessionStatus::Running,
            start_time,
            end_time: None,
            error: None,
            result: None,
            announced: true,
        });
        Applied::Updated
    }

    fn step_started(&mut self, test_id: &str, step: String, start_time: DateTime<Utc>) -> Applied {
        let session = self.session_for(test_id, start_time);
        if session.status == SessionStatus::Waiting {
            session.status = SessionStatus::Running;
        }

        let entry = self.steps.entry(step).or_default();
        match entry.status {
            StepStatus::Completed | StepStatus::Error => {
                Applied::Ignored(IgnoreReason::TerminalStep)
            }
            StepStatus::Running => {
                // Redelivered start: keep the earliest start and the progress
                // already recorded.
                match entry.start_time {
                    Some(existing) if existing <= start_time => {}
                    _ => entry.start_time = Some(start_time),
                }
                Applied::Updated
            }
            StepStatus::Pending => {
                entry.status = StepStatus::Running;
                entry.progress_percent = 0;
                entry.start_time = Some(start_time);
                Applied::Updated
            }
        }
    }

    fn step_progress(
        &mut self,
        test_id: &str,
        step: &str,
        percent: u8,
        message: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Applied {
        self.session_for(test_id, received_at);
        let Some(entry) = self.steps.get_mut(step) else {
            return Applied::Ignored(IgnoreReason::NotRunning);
        };
        match entry.status {
            StepStatus::Completed | StepStatus::Error => {
                return Applied::Ignored(IgnoreReason::TerminalStep);
            }
            StepStatus::Pending => return Applied::Ignored(IgnoreReason::NotRunning),
            StepStatus::Running => {}
        }

        if percent < entry.progress_percent && entry.progress_percent != 0 {
            debug!(step, percent, current = entry.progress_percent, "ignoring stale progress");
            return Applied::Ignored(IgnoreReason::StalePercent);
        }
        entry.progress_percent = percent;
        if message.is_some() {
            entry.message = message;
        }
        Applied::Updated
    }

    #[allow(clippy::too_many_arguments)]
    fn step_finished(
        &mut self,
        test_id: &str,
        step: String,
        status: StepStatus,
        end_time: DateTime<Utc>,
        start_time: Option<DateTime<Utc>>,
        message: Option<String>,
        details: Option<Value>,
    ) -> Applied {
        self.session_for(test_id, end_time);
        let entry = self.steps.entry(step).or_default();

        if entry.status == StepStatus::Pending {
            // Never seen as started: synthesize the running entry so a duration
            // can still be derived when the completion carries a start time.
            entry.status = StepStatus::Running;
            entry.start_time = start_time;
        } else if entry.start_time.is_none() {
            entry.start_time = start_time;
        }

        entry.status = status;
        entry.end_time = Some(end_time);
        if status == StepStatus::Completed {
            entry.progress_percent = 100;
        }
        if message.is_some() {
            entry.message = message;
        }
        if details.is_some() {
            entry.details = details;
        }
        Applied::Updated
    }

    fn test_finished(
        &mut self,
        test_id: &str,
        status: SessionStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
        result: Option<Value>,
    ) -> Applied {
        let session = self.session_for(test_id, end_time);
        session.status = status;
        session.end_time = Some(end_time);
        if message.is_some() {
            session.error = message;
        }
        if result.is_some() {
            session.result = result;
        }
        if status == SessionStatus::Error {
            warn!(test_id, error = ?session.error, "pipeline test failed");
        }
        Applied::Updated
    }
}

fn clamp_percent(raw: f64) -> Option<u8> {
    if raw.is_nan() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}
