//! Push-channel transport: dialing, the connection state machine and the
//! reconnect schedule.

pub mod backoff;
pub mod channel;
pub mod dialer;

pub use backoff::BackoffSchedule;
pub use channel::{ChannelTransport, Outbound, TransportEvent, TransportSettings};
pub use dialer::{CredentialProvider, Dialer, FrameSink, FrameStream, Link, WsDialer};
