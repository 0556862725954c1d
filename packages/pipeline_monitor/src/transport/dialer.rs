//! Opening a push link.
//!
//! A `Link` is a text-frame sink plus a text-frame stream. `WsDialer` opens
//! one over a websocket; tests substitute an in-memory dialer.

use std::future::{self, Future};
use std::pin::Pin;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::debug;

use crate::error::ChannelError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// One established push connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

pub trait Dialer: Send + Sync + 'static {
    /// Open a link to `url`, presenting `credential` during the handshake.
    fn dial(
        &self,
        url: &str,
        credential: &str,
    ) -> impl Future<Output = Result<Link, ChannelError>> + Send;
}

/// Supplies the bearer credential. Asked once per connection attempt, so a
/// refreshed token is picked up on the next reconnect.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn credential(&self) -> Option<String> {
        self()
    }
}

/// Websocket dialer. The credential goes in an `Authorization: Bearer`
/// header on the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct WsDialer;

impl Dialer for WsDialer {
    async fn dial(&self, url: &str, credential: &str) -> Result<Link, ChannelError> {
        let mut request = url
            .into_client_request()
            .map_err(ChannelError::from_tungstenite)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| ChannelError::NegotiationFailed(format!("invalid credential: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(ChannelError::from_tungstenite)?;
        debug!(url, status = %response.status(), "push channel upgraded");

        let (ws_write, ws_read) = ws.split();
        let sink = ws_write
            .sink_map_err(ChannelError::from_tungstenite)
            .with(|frame: String| {
                future::ready(Ok::<_, ChannelError>(Message::Text(frame.into())))
            });
        let stream = ws_read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::from_tungstenite(e))),
            })
        });

        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }
}
