//! Real-time monitor for multi-step pipeline test runs.
//!
//! Live step telemetry arrives over a push channel while an authoritative
//! batch result arrives from a blocking request/response call. The monitor
//! keeps a monotonic per-step view of the former and merges it with the
//! latter once the call returns.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod merger;
pub mod model;
pub mod monitor;
pub mod normalize;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod test_helpers;

pub use client::{PipelineClient, PipelineTestRequest};
pub use config::{MonitorConfig, load_config};
pub use error::{
    ChannelError, ClientError, MalformedEvent, MergeTimeout, MonitorError, RegistryError,
};
pub use logging::{LoggingConfig, init_tracing};
pub use merger::{MergeSettings, ReconciledResult, ReconciledStep, ResultMerger, StepSource};
pub use model::{
    BatchResult, ConnectionState, ConnectionStatus, Session, SessionStatus, StepProgress,
    StepResult, StepStatus,
};
pub use monitor::{IngestStats, MonitorSnapshot, PipelineMonitor};
pub use protocol::{ClientMessage, ServerEvent};
pub use reconciler::{Applied, IgnoreReason, ProgressReconciler};
pub use registry::{JoinOutcome, LeaveOutcome, SessionRegistry, Subscription};
pub use transport::{
    BackoffSchedule, ChannelTransport, CredentialProvider, Dialer, TransportEvent,
    TransportSettings, WsDialer,
};
