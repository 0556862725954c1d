//! Push-channel protocol types
//!
//! Every frame is one JSON object tagged by `"type"`. Inbound frames go
//! through [`crate::normalize::canonicalize_event`] before decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedEvent;
use crate::normalize::canonicalize_event;

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to lifecycle events for one test run
    JoinSession { test_id: String },
    /// Drop the subscription
    LeaveSession { test_id: String },
    /// Fire-and-forget liveness ping, sent only while connected
    Heartbeat { timestamp: DateTime<Utc> },
}

impl ClientMessage {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    // === Run lifecycle ===
    TestStarted {
        test_id: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        query: String,
        #[serde(default)]
        steps: Vec<String>,
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
    },
    TestCompleted {
        test_id: String,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
        #[serde(default)]
        result: Option<Value>,
    },
    TestError {
        test_id: String,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        result: Option<Value>,
    },

    // === Step lifecycle ===
    StepStarted {
        test_id: String,
        step_name: String,
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
    },
    StepProgress {
        test_id: String,
        step_name: String,
        progress_percent: f64,
        #[serde(default)]
        message: Option<String>,
    },
    StepCompleted {
        test_id: String,
        step_name: String,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
        /// Lets a completion that overtook its `StepStarted` still yield a duration
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
        #[serde(default)]
        details: Option<Value>,
    },
    StepError {
        test_id: String,
        step_name: String,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<Value>,
    },

    // === Control ===
    SessionJoined {
        test_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    SessionLeft {
        test_id: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    HeartbeatAck {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "TestStarted",
    "TestCompleted",
    "TestError",
    "StepStarted",
    "StepProgress",
    "StepCompleted",
    "StepError",
    "SessionJoined",
    "SessionLeft",
    "HeartbeatAck",
];

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TestStarted { .. } => "TestStarted",
            Self::TestCompleted { .. } => "TestCompleted",
            Self::TestError { .. } => "TestError",
            Self::StepStarted { .. } => "StepStarted",
            Self::StepProgress { .. } => "StepProgress",
            Self::StepCompleted { .. } => "StepCompleted",
            Self::StepError { .. } => "StepError",
            Self::SessionJoined { .. } => "SessionJoined",
            Self::SessionLeft { .. } => "SessionLeft",
            Self::HeartbeatAck { .. } => "HeartbeatAck",
        }
    }

    pub fn test_id(&self) -> Option<&str> {
        match self {
            Self::TestStarted { test_id, .. }
            | Self::TestCompleted { test_id, .. }
            | Self::TestError { test_id, .. }
            | Self::StepStarted { test_id, .. }
            | Self::StepProgress { test_id, .. }
            | Self::StepCompleted { test_id, .. }
            | Self::StepError { test_id, .. }
            | Self::SessionJoined { test_id, .. }
            | Self::SessionLeft { test_id, .. } => Some(test_id),
            Self::HeartbeatAck { .. } => None,
        }
    }

    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_name, .. }
            | Self::StepProgress { step_name, .. }
            | Self::StepCompleted { step_name, .. }
            | Self::StepError { step_name, .. } => Some(step_name),
            _ => None,
        }
    }

    /// Control traffic handled by the registry and facade rather than the reconciler.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::SessionJoined { .. } | Self::SessionLeft { .. } | Self::HeartbeatAck { .. }
        )
    }
}

/// Decode one text frame into a canonical event.
pub fn decode_event(frame: &str) -> Result<ServerEvent, MalformedEvent> {
    let raw: Value =
        serde_json::from_str(frame).map_err(|e| MalformedEvent::InvalidJson(e.to_string()))?;
    let canonical = canonicalize_event(raw);

    let kind = match canonical.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => return Err(MalformedEvent::UnknownKind(other.to_string())),
        None => return Err(MalformedEvent::UnknownKind(String::new())),
    };
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(MalformedEvent::UnknownKind(kind));
    }

    serde_json::from_value(canonical).map_err(|e| MalformedEvent::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}
