//! Data model shared by the transport, reconciler, merger and facade.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::normalize::canonicalize_fields;

/// Push-channel lifecycle. Owned by `ChannelTransport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Connection state plus the last connection-level error, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Running,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One monitored pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub test_id: String,
    pub query: String,
    pub requested_steps: Vec<String>,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
    /// Set once a `TestStarted` has been applied. Sessions seeded from a join
    /// ack or from early step events are not announced yet.
    #[serde(skip)]
    pub(crate) announced: bool,
}

impl Session {
    /// A session seeded before the backend announced the run.
    pub fn waiting(test_id: &str, since: DateTime<Utc>) -> Self {
        Self {
            session_id: test_id.to_string(),
            test_id: test_id.to_string(),
            query: String::new(),
            requested_steps: Vec::new(),
            status: SessionStatus::Waiting,
            start_time: since,
            end_time: None,
            error: None,
            result: None,
            announced: false,
        }
    }

    pub fn is_announced(&self) -> bool {
        self.announced
    }

    pub fn expects_step(&self, step: &str) -> bool {
        self.requested_steps.is_empty() || self.requested_steps.iter().any(|s| s == step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Live progress for one step of the active session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub status: StepStatus,
    pub progress_percent: u8,
    pub message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub details: Option<Value>,
}

impl StepProgress {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            progress_percent: 0,
            message: None,
            start_time: None,
            end_time: None,
            details: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `end_time - start_time`, or `None` when either timestamp is unknown.
    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.start_time?, self.end_time?);
        let millis = (end - start).num_milliseconds();
        Some(millis.max(0) as u64)
    }
}

impl Default for StepProgress {
    fn default() -> Self {
        Self::pending()
    }
}

/// Per-step entry of a batch result. Everything besides the fields below is
/// kept verbatim in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(
        default,
        deserialize_with = "lenient_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

fn default_success() -> bool {
    true
}

/// Authoritative result of the request/response call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub total_duration_ms: Option<u64>,
    #[serde(default)]
    pub results: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    /// Decode a response body, folding legacy key spellings first. Step names
    /// used as keys of `results` are left untouched.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let value = match value {
            Value::Object(map) => {
                let mut map = canonicalize_fields(map);
                if let Some(Value::Object(results)) = map.remove("results") {
                    let results = results
                        .into_iter()
                        .map(|(step, entry)| match entry {
                            Value::Object(fields) => {
                                (step, Value::Object(canonicalize_fields(fields)))
                            }
                            other => (step, other),
                        })
                        .collect();
                    map.insert("results".to_string(), Value::Object(results));
                }
                Value::Object(map)
            }
            other => other,
        };
        serde_json::from_value(value)
    }
}

/// Accepts integers, floats and nulls for millisecond fields.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| millis_from_value(&v)))
}

pub(crate) fn millis_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        }),
        _ => None,
    }
}
