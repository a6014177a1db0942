#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use emojigrid_client::client::{DisplayCell, GridEvent};
use emojigrid_client::{CatalogId, GridDims};
use grid_proto::{UpdateMessage, decode_update, encode_snapshot, encode_update};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const ALREADY_SET: &str = "Error: value already set";

pub fn id(raw: u16) -> CatalogId {
    CatalogId::new(raw).unwrap()
}

/// Wait for the first `CellChanged` at `(row, col)` and return its cell.
pub async fn next_change_at(
    events: &mut broadcast::Receiver<GridEvent>,
    row: usize,
    col: usize,
) -> DisplayCell {
    loop {
        match events.recv().await {
            Ok(GridEvent::CellChanged {
                row: r,
                col: c,
                cell,
            }) if (r, c) == (row, col) => return cell,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => panic!("replica event stream closed"),
        }
    }
}

/// Minimal grid server: snapshot on connect, first write wins, every accepted
/// write is broadcast to all sessions including the writer.
pub struct FixtureServer {
    addr: SocketAddr,
    state: Arc<FixtureState>,
    task: JoinHandle<()>,
}

struct FixtureState {
    dims: GridDims,
    cells: Mutex<Vec<u16>>,
    updates: broadcast::Sender<String>,
}

impl FixtureServer {
    pub async fn start(dims: GridDims) -> Self {
        let (updates, _) = broadcast::channel(1024);
        let state = Arc::new(FixtureState {
            dims,
            cells: Mutex::new(vec![0; dims.cell_count()]),
            updates,
        });
        let app = Router::new()
            .route("/ws", get(upgrade))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn value(&self, row: usize, col: usize) -> u16 {
        let index = self.state.dims.index(row, col).unwrap();
        self.state.cells.lock()[index]
    }

    /// Write as if another client had claimed the cell.
    pub fn place(&self, row: usize, col: usize, value: u16) -> bool {
        self.state.claim(UpdateMessage::new(row as i64, col as i64, value as i64))
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FixtureState {
    fn claim(&self, msg: UpdateMessage) -> bool {
        let (Ok(row), Ok(col)) = (usize::try_from(msg.row), usize::try_from(msg.col)) else {
            return false;
        };
        let Some(index) = self.dims.index(row, col) else {
            return false;
        };
        let value = msg.masked_value() as u16;
        {
            let mut cells = self.cells.lock();
            if value == 0 || cells[index] != 0 {
                return false;
            }
            cells[index] = value;
        }
        let _ = self.updates.send(encode_update(&msg));
        true
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<FixtureState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

enum SocketEvent {
    FromClient(Option<Message>),
    Broadcast(Result<String, RecvError>),
}

async fn serve_socket(mut socket: WebSocket, state: Arc<FixtureState>) {
    let mut updates = state.updates.subscribe();
    let snapshot = encode_snapshot(&state.cells.lock());
    if socket.send(Message::Binary(snapshot)).await.is_err() {
        return;
    }

    loop {
        let event = tokio::select! {
            inbound = socket.recv() => SocketEvent::FromClient(inbound.and_then(Result::ok)),
            update = updates.recv() => SocketEvent::Broadcast(update),
        };
        let reply = match event {
            SocketEvent::FromClient(None) | SocketEvent::FromClient(Some(Message::Close(_))) => {
                return;
            }
            SocketEvent::FromClient(Some(Message::Text(text))) => match decode_update(&text) {
                Ok(msg) if state.claim(msg) => None,
                Ok(_) => Some(ALREADY_SET.to_string()),
                Err(_) => None,
            },
            SocketEvent::FromClient(Some(_)) => None,
            SocketEvent::Broadcast(Ok(text)) => Some(text),
            SocketEvent::Broadcast(Err(RecvError::Lagged(_))) => None,
            SocketEvent::Broadcast(Err(RecvError::Closed)) => return,
        };
        if let Some(text) = reply {
            if socket.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    }
}
