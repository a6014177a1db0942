//! In-memory transport for tests.
//!
//! [`MockConnector`] hands every accepted connection's far end to a
//! [`MockServer`], so a test can play the server: push snapshots and updates,
//! read the client's writes, and hang up or fail the link on demand.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use grid_proto::{UpdateMessage, decode_update, encode_update};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connector, Payload, Transport, TransportError};
use crate::protocol::Snapshot;

type Inbound = Result<Payload, TransportError>;

pub struct MockTransport {
    tx: mpsc::UnboundedSender<Payload>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    connected: Arc<AtomicBool>,
}

/// The server's side of a [`MockTransport`].
pub struct RemoteEnd {
    to_client: Option<mpsc::UnboundedSender<Inbound>>,
    from_client: mpsc::UnboundedReceiver<Payload>,
    connected: Arc<AtomicBool>,
}

pub fn pair() -> (MockTransport, RemoteEnd) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));
    (
        MockTransport {
            tx: to_server,
            rx: from_server,
            connected: connected.clone(),
        },
        RemoteEnd {
            to_client: Some(to_client),
            from_client,
            connected,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.tx.send(payload).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Inbound> {
        let next = self.rx.recv().await;
        if next.is_none() {
            self.connected.store(false, Ordering::Release);
        }
        next
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.rx.close();
    }
}

impl RemoteEnd {
    pub fn push(&self, payload: Payload) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(Ok(payload)).is_ok())
            .unwrap_or(false)
    }

    pub fn push_snapshot(&self, snapshot: &Snapshot) -> bool {
        self.push(Payload::Binary(snapshot.encode()))
    }

    pub fn push_update(&self, msg: UpdateMessage) -> bool {
        self.push(Payload::Text(encode_update(&msg)))
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Payload::Text(text.into()))
    }

    /// End the connection abnormally.
    pub fn fail(&mut self, err: TransportError) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.send(Err(err));
        }
        self.connected.store(false, Ordering::Release);
    }

    /// End the connection cleanly.
    pub fn hang_up(&mut self) {
        self.to_client.take();
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn next_payload(&mut self) -> Option<Payload> {
        self.from_client.recv().await
    }

    /// Next write intent from the client, skipping anything that is not one.
    pub async fn next_update(&mut self) -> Option<UpdateMessage> {
        while let Some(payload) = self.from_client.recv().await {
            if let Payload::Text(text) = payload {
                if let Ok(msg) = decode_update(&text) {
                    return Some(msg);
                }
            }
        }
        None
    }

    pub fn try_next_payload(&mut self) -> Option<Payload> {
        self.from_client.try_recv().ok()
    }
}

/// Test-side handle that accepts connections made through a [`MockConnector`].
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<RemoteEnd>,
    refusals: Arc<Mutex<VecDeque<TransportError>>>,
    attempts: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn accept(&mut self) -> Option<RemoteEnd> {
        self.accepted.recv().await
    }

    /// Fail the next connection attempt with `err`. Refusals queue up.
    pub fn refuse_next(&self, err: TransportError) {
        self.refusals.lock().push_back(err);
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

pub struct MockConnector {
    accepted: mpsc::UnboundedSender<RemoteEnd>,
    refusals: Arc<Mutex<VecDeque<TransportError>>>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let refusals = Arc::new(Mutex::new(VecDeque::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                accepted: accepted_tx,
                refusals: refusals.clone(),
                attempts: attempts.clone(),
            },
            MockServer {
                accepted: accepted_rx,
                refusals,
                attempts,
            },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if let Some(err) = self.refusals.lock().pop_front() {
            return Err(err);
        }
        let (transport, remote) = pair();
        self.accepted
            .send(remote)
            .map_err(|_| TransportError::Connect {
                endpoint: self.describe(),
                reason: "mock server dropped".into(),
            })?;
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        "mock://grid".into()
    }
}
