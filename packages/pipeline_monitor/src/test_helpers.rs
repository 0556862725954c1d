//! In-memory push links for tests.
//!
//! `ScriptedDialer` accepts or rejects dials according to a script (an empty
//! script accepts) and hands the server half of every accepted link to the
//! test through a channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::channel::mpsc as link_mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::ChannelError;
use crate::protocol::ClientMessage;
use crate::transport::{CredentialProvider, Dialer, Link};

pub enum Outcome {
    Accept,
    Reject(ChannelError),
}

struct ScriptedInner {
    script: Mutex<VecDeque<Outcome>>,
    attempts: watch::Sender<Vec<Instant>>,
    credentials: Mutex<Vec<String>>,
    servers: mpsc::UnboundedSender<FakeServer>,
}

#[derive(Clone)]
pub struct ScriptedDialer {
    inner: Arc<ScriptedInner>,
}

impl ScriptedDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, servers_rx) = mpsc::unbounded_channel();
        let (attempts, _) = watch::channel(Vec::new());
        let dialer = Self {
            inner: Arc::new(ScriptedInner {
                script: Mutex::new(VecDeque::new()),
                attempts,
                credentials: Mutex::new(Vec::new()),
                servers,
            }),
        };
        (dialer, servers_rx)
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.inner.script.lock().unwrap().extend(outcomes);
    }

    pub fn attempts(&self) -> usize {
        self.inner.attempts.borrow().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.inner.attempts.borrow().clone()
    }

    pub async fn wait_for_attempts(&self, n: usize) {
        let mut rx = self.inner.attempts.subscribe();
        rx.wait_for(|attempts| attempts.len() >= n).await.unwrap();
    }

    pub fn credentials_seen(&self) -> Vec<String> {
        self.inner.credentials.lock().unwrap().clone()
    }
}

impl Dialer for ScriptedDialer {
    async fn dial(&self, _url: &str, credential: &str) -> Result<Link, ChannelError> {
        self.inner
            .attempts
            .send_modify(|attempts| attempts.push(Instant::now()));
        self.inner
            .credentials
            .lock()
            .unwrap()
            .push(credential.to_string());
        let outcome = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Accept);

        match outcome {
            Outcome::Reject(e) => Err(e),
            Outcome::Accept => {
                let (link, server) = fake_link();
                let _ = self.inner.servers.send(server);
                Ok(link)
            }
        }
    }
}

/// Server half of an in-memory link. Dropping it ends the client's stream,
/// which the transport treats as a lost connection.
pub struct FakeServer {
    inbound: link_mpsc::UnboundedReceiver<String>,
    outbound: link_mpsc::UnboundedSender<Result<String, ChannelError>>,
}

impl FakeServer {
    pub fn push(&self, event: Value) {
        self.push_raw(&event.to_string());
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.outbound.unbounded_send(Ok(frame.to_string()));
    }

    /// Next client message, or `None` once the client closed its side.
    pub async fn next_message(&mut self) -> Option<ClientMessage> {
        let frame = self.inbound.next().await?;
        Some(serde_json::from_str(&frame).unwrap())
    }

    /// Next client message that is not a heartbeat.
    pub async fn next_control(&mut self) -> Option<ClientMessage> {
        loop {
            match self.next_message().await? {
                ClientMessage::Heartbeat { .. } => continue,
                other => return Some(other),
            }
        }
    }

    /// Drop the link with a transport error instead of a clean close.
    pub fn fail(self, reason: &str) {
        let _ = self
            .outbound
            .unbounded_send(Err(ChannelError::Transport(reason.to_string())));
    }
}

fn fake_link() -> (Link, FakeServer) {
    let (client_tx, server_rx) = link_mpsc::unbounded::<String>();
    let (server_tx, client_rx) = link_mpsc::unbounded::<Result<String, ChannelError>>();

    let sink = client_tx.sink_map_err(|e| ChannelError::Transport(e.to_string()));
    let link = Link::new(Box::pin(sink), Box::pin(client_rx));
    let server = FakeServer {
        inbound: server_rx,
        outbound: server_tx,
    };
    (link, server)
}

pub fn test_credential() -> Arc<dyn CredentialProvider> {
    Arc::new(|| Some("test-token".to_string()))
}

pub fn no_credential() -> Arc<dyn CredentialProvider> {
    Arc::new(|| None::<String>)
}
