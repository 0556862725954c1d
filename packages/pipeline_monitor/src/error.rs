//! Error types and stable error codes.
//!
//! Connection-level failures are also surfaced as observable state
//! (`ConnectionStatus::error`), so most of these never reach a UI as a
//! hard failure. The batch call's own `ClientError` is the exception.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::model::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("no credential available")]
    AuthUnavailable,

    #[error("handshake rejected: {0}")]
    NegotiationFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,
}

impl ChannelError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AuthUnavailable => "auth_unavailable",
            Self::NegotiationFailed(_) => "negotiation_failed",
            Self::Transport(_) => "transport_error",
            Self::NotConnected => "not_connected",
        }
    }

    /// Whether the reconnect loop should keep trying after this failure.
    /// A missing credential fails closed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthUnavailable)
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                Self::NegotiationFailed(format!("server responded {}", response.status()))
            }
            tungstenite::Error::Protocol(e) => Self::NegotiationFailed(e.to_string()),
            tungstenite::Error::Io(io_err) => Self::Transport(io_err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Join requested while the channel was not connected. Retry once connected.
    #[error("join skipped for {test_id}: channel is {state}")]
    JoinSkipped {
        test_id: String,
        state: ConnectionState,
    },

    #[error("failed to send control message: {0}")]
    Send(#[from] ChannelError),
}

impl RegistryError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::JoinSkipped { .. } => "join_skipped",
            Self::Send(e) => e.error_code(),
        }
    }
}

/// An inbound push message that could not be turned into a usable event.
/// Always logged and dropped at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEvent {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("unknown event kind {0:?}")]
    UnknownKind(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("unknown step {step:?} for test {test_id}")]
    UnknownStep { test_id: String, step: String },

    #[error("invalid progress percent for step {step:?}")]
    InvalidPercent { step: String },
}

impl MalformedEvent {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::UnknownStep { .. } => "unknown_step",
            Self::InvalidPercent { .. } => "invalid_percent",
        }
    }
}

/// The merge grace window elapsed before streamed telemetry settled.
/// The merge proceeds with whatever telemetry had arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "telemetry did not settle within {}ms; {} step(s) still open",
    .waited.as_millis(),
    .open_steps.len()
)]
pub struct MergeTimeout {
    pub waited: Duration,
    pub open_steps: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("pipeline service is unavailable")]
    Unavailable,

    #[error("pipeline service responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode batch result: {0}")]
    Decode(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::Http(_) => "http",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Batch(#[from] ClientError),

    #[error("monitor actor is gone")]
    ActorGone,
}
