//! SessionRegistry: which test run this client is subscribed to.
//!
//! At most one subscription is held at a time. Joining a new test leaves the
//! previous one first. The registry does not own the connection; it writes
//! control messages through an [`Outbound`] and is told about connection
//! loss and recovery so it can rejoin after a reconnect.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::protocol::ClientMessage;
use crate::transport::Outbound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub test_id: String,
    pub requested_at: DateTime<Utc>,
    /// Set when the server acknowledged the join
    pub joined_at: Option<DateTime<Utc>>,
    /// The link dropped since the join was sent
    pub needs_rejoin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Sent,
    AlreadyJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Sent,
    /// Channel was down; the subscription was dropped without telling the server
    ClearedLocally,
    NotJoined,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    current: Option<Subscription>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Subscription> {
        self.current.as_ref()
    }

    pub fn current_test(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.test_id.as_str())
    }

    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        self.current.as_ref().and_then(|s| s.joined_at)
    }

    /// Subscribe to `test_id`. Joining the test already subscribed sends
    /// nothing.
    pub fn join(
        &mut self,
        out: &impl Outbound,
        test_id: &str,
    ) -> Result<JoinOutcome, RegistryError> {
        let state = out.state();
        if !state.is_connected() {
            warn!(test_id, %state, "join skipped, push channel not connected");
            return Err(RegistryError::JoinSkipped {
                test_id: test_id.to_string(),
                state,
            });
        }

        if let Some(current) = &self.current {
            if current.test_id == test_id && !current.needs_rejoin {
                debug!(test_id, "already joined");
                return Ok(JoinOutcome::AlreadyJoined);
            }
            if current.test_id != test_id {
                let previous = current.test_id.clone();
                if let Err(e) = out.send_message(&ClientMessage::LeaveSession {
                    test_id: previous.clone(),
                }) {
                    warn!(test_id = %previous, error = %e, "failed to leave previous session");
                }
                self.current = None;
            }
        }

        out.send_message(&ClientMessage::JoinSession {
            test_id: test_id.to_string(),
        })?;
        info!(test_id, "joined session");
        self.current = Some(Subscription {
            test_id: test_id.to_string(),
            requested_at: Utc::now(),
            joined_at: None,
            needs_rejoin: false,
        });
        Ok(JoinOutcome::Sent)
    }

    /// Drop the subscription to `test_id`. While disconnected the local
    /// subscription is still cleared so a later reconnect does not rejoin it.
    pub fn leave(
        &mut self,
        out: &impl Outbound,
        test_id: &str,
    ) -> Result<LeaveOutcome, RegistryError> {
        if self.current_test() != Some(test_id) {
            debug!(test_id, "leave ignored, not joined");
            return Ok(LeaveOutcome::NotJoined);
        }
        self.current = None;

        if !out.state().is_connected() {
            debug!(test_id, "left session locally, push channel down");
            return Ok(LeaveOutcome::ClearedLocally);
        }
        out.send_message(&ClientMessage::LeaveSession {
            test_id: test_id.to_string(),
        })?;
        info!(test_id, "left session");
        Ok(LeaveOutcome::Sent)
    }

    /// Server acknowledged a join. Returns false for acks that do not match
    /// the current subscription.
    pub fn on_joined(&mut self, test_id: &str, at: DateTime<Utc>) -> bool {
        match &mut self.current {
            Some(current) if current.test_id == test_id => {
                current.joined_at.get_or_insert(at);
                true
            }
            _ => {
                debug!(test_id, "join ack for a session we are not subscribed to");
                false
            }
        }
    }

    /// Server confirmed a leave, or dropped us from the group.
    pub fn on_left(&mut self, test_id: &str) {
        if self.current_test() == Some(test_id) {
            info!(test_id, "server removed session subscription");
            self.current = None;
        }
    }

    pub fn on_connection_lost(&mut self) {
        if let Some(current) = &mut self.current {
            current.needs_rejoin = true;
            current.joined_at = None;
        }
    }

    /// Re-send the join for the current subscription after a reconnect.
    pub fn on_reconnected(
        &mut self,
        out: &impl Outbound,
    ) -> Result<Option<JoinOutcome>, RegistryError> {
        let Some(test_id) = self
            .current
            .as_ref()
            .filter(|s| s.needs_rejoin)
            .map(|s| s.test_id.clone())
        else {
            return Ok(None);
        };
        info!(test_id = %test_id, "rejoining session after reconnect");
        self.join(out, &test_id).map(Some)
    }
}
