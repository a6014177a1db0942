use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use super::{Connector, Payload, Transport, TransportError};

pub mod config;
pub use config::WebSocketConfig;

type Inbound = Result<Payload, TransportError>;

/// WebSocket connection to the grid server. A background task owns the
/// socket; this handle talks to it over channels.
pub struct WebSocketTransport {
    endpoint: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    connected: Arc<AtomicBool>,
    ws_task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub async fn connect(config: &WebSocketConfig) -> Result<Self, TransportError> {
        let url = config.endpoint()?;
        let endpoint = url.to_string();
        let (ws_stream, response) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    endpoint: endpoint.clone(),
                    reason: err.to_string(),
                })?;
        debug!(
            target: "transport::websocket",
            endpoint = %endpoint,
            status = %response.status(),
            "websocket connected"
        );

        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let ws_task = tokio::spawn(pump(ws_stream, rx_out, tx_in, connected.clone()));

        Ok(Self {
            endpoint,
            tx: tx_out,
            rx: rx_in,
            connected,
            ws_task: Some(ws_task),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let message = match payload {
            Payload::Binary(bytes) => Message::Binary(bytes),
            Payload::Text(text) => Message::Text(text),
        };
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Message::Close(None));
        }
        if let Some(task) = self.ws_task.take() {
            // Give the close frame a chance to go out before tearing down.
            if tokio::time::timeout(std::time::Duration::from_millis(500), task)
                .await
                .is_err()
            {
                trace!(target: "transport::websocket", "close handshake timed out");
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.ws_task.take() {
            task.abort();
        }
    }
}

async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Message>,
    tx_in: mpsc::UnboundedSender<Inbound>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = rx_out.recv() => {
                let Some(message) = outbound else {
                    let _ = ws_sender.close().await;
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_sender.send(message).await {
                    let _ = tx_in.send(Err(TransportError::WebSocket(err.to_string())));
                    break;
                }
                if closing {
                    break;
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        if tx_in.send(Ok(Payload::Binary(bytes))).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if tx_in.send(Ok(Payload::Text(text))).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            target: "transport::websocket",
                            frame = ?frame,
                            "peer closed websocket"
                        );
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(tungstenite::Error::ConnectionClosed)) | None => break,
                    Some(Err(err)) => {
                        warn!(
                            target: "transport::websocket",
                            error = %err,
                            "websocket receive failed"
                        );
                        let _ = tx_in.send(Err(TransportError::WebSocket(err.to_string())));
                        break;
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
}

/// Connects to a fixed websocket endpoint on every attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = WebSocketTransport::connect(&self.config).await?;
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        self.config.build_url()
    }
}
