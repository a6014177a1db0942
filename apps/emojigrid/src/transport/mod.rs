use async_trait::async_trait;

pub mod mock;
pub mod websocket;

/// One frame as the server sees it. The frame kind carries meaning: binary is
/// always a snapshot, text is always an update (or a server notice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Binary(_) => "binary",
            Payload::Text(_) => "text",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Binary(bytes) => bytes.len(),
            Payload::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// A live, bidirectional connection to the grid server.
///
/// `recv` must be cancellation safe: the client polls it inside `select!`
/// alongside its outbound queue.
#[async_trait]
pub trait Transport: Send {
    async fn send(&self, payload: Payload) -> Result<(), TransportError>;

    /// Next inbound frame. `None` means the peer closed cleanly; `Some(Err(_))`
    /// is an abnormal end of the connection.
    async fn recv(&mut self) -> Option<Result<Payload, TransportError>>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}

/// Opens fresh transports. The client calls this once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}
