//! The grid client: one driver task per process that owns the connection
//! lifecycle and the only live transport, plus cloneable handles for readers
//! and writers.
//!
//! Inbound frames are applied to the replica strictly in arrival order on the
//! driver task. Malformed frames and impossible updates are dropped, logged
//! and counted; they never end the session.

pub mod replica;
pub mod viewport;
pub mod writes;

use std::sync::Arc;

use grid_proto::{CatalogId, GridDims, UpdateMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::GridError;
use crate::protocol::{self, Delta, FrameDecoder, InboundFrame};
use crate::session::{ConnectionLifecycle, ConnectionState, ReconnectPolicy};
use crate::telemetry;
use crate::transport::{Connector, Payload, Transport, TransportError};

pub use replica::{DisplayCell, GridEvent, GridReplica, ReplicaState};
pub use viewport::{ProjectedCell, Viewport, ViewportChange, ViewportProjector};
pub use writes::{Reconciliation, RejectReason, WriteDecision};

#[derive(Clone)]
pub struct GridHandle {
    replica: GridReplica,
    outbound: mpsc::UnboundedSender<UpdateMessage>,
    state: watch::Receiver<ConnectionState>,
    snapshots: watch::Receiver<u64>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl GridHandle {
    pub fn replica(&self) -> &GridReplica {
        &self.replica
    }

    pub fn dims(&self) -> GridDims {
        self.replica.dims()
    }

    /// Claim an empty cell. Accepted writes show as pending at once and are
    /// sent if a session is live; otherwise they go out after the next
    /// snapshot.
    pub fn request_write(
        &self,
        row: usize,
        col: usize,
        value: CatalogId,
    ) -> Result<WriteDecision, GridError> {
        let decision = self.replica.request_write(row, col, value)?;
        if let WriteDecision::Accepted(delta) = decision {
            if self.outbound.send(delta.to_wire()).is_err() {
                debug!(
                    target: "client::writes",
                    row, col, "client stopped; write stays pending"
                );
            }
        }
        Ok(decision)
    }

    /// Authoritative value at `(row, col)`, 0 meaning empty.
    pub fn read(&self, row: usize, col: usize) -> Result<u16, GridError> {
        self.replica.value(row, col)
    }

    /// Merged value including pending local writes.
    pub fn cell(&self, row: usize, col: usize) -> Result<DisplayCell, GridError> {
        self.replica.cell(row, col)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.replica.subscribe()
    }

    pub fn projector(&self, visible: Viewport, overscan: usize) -> ViewportProjector {
        ViewportProjector::new(&self.replica, visible, overscan)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`. Returns `false` if the
    /// client stopped first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|current| *current == target).await.is_ok()
    }

    /// Snapshots applied since start.
    pub fn snapshot_generation(&self) -> u64 {
        *self.snapshots.borrow()
    }

    /// Wait until more than `seen` snapshots have been applied. Returns the new
    /// generation, or `None` if the client stopped first.
    pub async fn wait_for_snapshot_after(&self, seen: u64) -> Option<u64> {
        let mut snapshots = self.snapshots.clone();
        snapshots
            .wait_for(|generation| *generation > seen)
            .await
            .ok()
            .map(|generation| *generation)
    }

    pub async fn wait_for_snapshot(&self) -> Option<u64> {
        self.wait_for_snapshot_after(0).await
    }

    /// Ask the driver to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Owns the driver task. Dropping it without calling [`GridClient::shutdown`]
/// leaves the task running until every handle is gone.
pub struct GridClient {
    handle: GridHandle,
    task: Option<JoinHandle<()>>,
}

impl GridClient {
    pub fn spawn<C>(connector: C, dims: GridDims, policy: Box<dyn ReconnectPolicy>) -> Self
    where
        C: Connector + 'static,
    {
        Self::spawn_with_replica(connector, GridReplica::new(dims), policy)
    }

    pub fn spawn_with_replica<C>(
        connector: C,
        replica: GridReplica,
        policy: Box<dyn ReconnectPolicy>,
    ) -> Self
    where
        C: Connector + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (snapshot_tx, snapshot_rx) = watch::channel(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            connector: Box::new(connector),
            decoder: FrameDecoder::new(replica.dims()),
            replica: replica.clone(),
            lifecycle: ConnectionLifecycle::new(policy),
            outbound: outbound_rx,
            state: state_tx,
            snapshots: snapshot_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            handle: GridHandle {
                replica,
                outbound: outbound_tx,
                state: state_rx,
                snapshots: snapshot_rx,
                shutdown: Arc::new(shutdown_tx),
            },
            task: Some(task),
        }
    }

    pub fn handle(&self) -> GridHandle {
        self.handle.clone()
    }

    /// Stop the driver and wait for it to close the transport.
    pub async fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(target: "client::session", error = %err, "driver task failed");
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed,
    Failed(TransportError),
}

enum SessionEvent {
    Shutdown,
    Inbound(Option<Result<Payload, TransportError>>),
    Outbound(UpdateMessage),
}

struct Driver {
    connector: Box<dyn Connector>,
    decoder: FrameDecoder,
    replica: GridReplica,
    lifecycle: ConnectionLifecycle,
    outbound: mpsc::UnboundedReceiver<UpdateMessage>,
    state: watch::Sender<ConnectionState>,
    snapshots: watch::Sender<u64>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let endpoint = self.connector.describe();
        let mut attempt = self.lifecycle.connect();

        'outer: while !self.stopping() {
            let Some(current) = attempt.take().or_else(|| self.lifecycle.connect()) else {
                break;
            };
            self.publish_state();
            debug!(
                target: "client::session",
                endpoint = %endpoint,
                attempt = current.attempt,
                "connecting"
            );

            let connected = tokio::select! {
                result = self.connector.connect() => Some(result),
                _ = self.shutdown.changed() => None,
            };
            let scheduled = match connected {
                None => break,
                Some(Ok(transport)) => {
                    self.lifecycle.session_established();
                    self.publish_state();
                    info!(target: "client::session", endpoint = %endpoint, "session established");
                    match self.run_session(transport).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => self.lifecycle.transport_closed(),
                        SessionEnd::Failed(err) => {
                            warn!(
                                target: "client::session",
                                endpoint = %endpoint,
                                error = %err,
                                "session failed"
                            );
                            self.lifecycle.transport_error(&err)
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(
                        target: "client::session",
                        endpoint = %endpoint,
                        attempt = current.attempt,
                        error = %err,
                        "connect failed"
                    );
                    self.lifecycle.transport_error(&err)
                }
            };
            self.publish_state();

            let Some(scheduled) = scheduled else {
                break;
            };
            let sleep = tokio::time::sleep(scheduled.delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => {
                        attempt = self.lifecycle.reconnect_due(scheduled.ticket);
                        continue 'outer;
                    }
                    _ = self.shutdown.changed() => break 'outer,
                    Some(msg) = self.outbound.recv() => {
                        debug!(
                            target: "client::writes",
                            row = msg.row,
                            col = msg.col,
                            "no live session; write stays pending"
                        );
                    }
                }
            }
        }

        self.lifecycle.shutdown();
        self.publish_state();
        debug!(target: "client::session", "driver stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn publish_state(&self) {
        let state = self.lifecycle.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn run_session(&mut self, mut transport: Box<dyn Transport>) -> SessionEnd {
        // Writes are held back until this session's first snapshot; that
        // snapshot decides which pending writes still need sending.
        let mut synced = false;
        loop {
            let event = tokio::select! {
                _ = self.shutdown.changed() => SessionEvent::Shutdown,
                inbound = transport.recv() => SessionEvent::Inbound(inbound),
                Some(msg) = self.outbound.recv() => SessionEvent::Outbound(msg),
            };

            let batch = match event {
                SessionEvent::Shutdown => {
                    transport.close().await;
                    return SessionEnd::Shutdown;
                }
                SessionEvent::Inbound(None) => {
                    info!(target: "client::session", "server closed the session");
                    return SessionEnd::Closed;
                }
                SessionEvent::Inbound(Some(Err(err))) => return SessionEnd::Failed(err),
                SessionEvent::Inbound(Some(Ok(payload))) => match self.handle_payload(&payload) {
                    Some(retained) if !synced => {
                        synced = true;
                        self.merge_queued(retained)
                    }
                    _ => Vec::new(),
                },
                SessionEvent::Outbound(msg) if !synced => {
                    debug!(
                        target: "client::writes",
                        row = msg.row,
                        col = msg.col,
                        "write held until snapshot"
                    );
                    Vec::new()
                }
                SessionEvent::Outbound(msg) if self.still_pending(&msg) => vec![msg],
                SessionEvent::Outbound(_) => Vec::new(),
            };

            for msg in batch {
                if let Err(err) = transport.send(protocol::encode_write(&msg)).await {
                    return SessionEnd::Failed(err);
                }
                debug!(
                    target: "client::writes",
                    row = msg.row,
                    col = msg.col,
                    value = msg.value,
                    "write sent"
                );
            }
        }
    }

    /// Writes still queued when the first snapshot lands were either resolved
    /// by it or are already in `retained`; only later ones are kept.
    fn merge_queued(&mut self, mut retained: Vec<UpdateMessage>) -> Vec<UpdateMessage> {
        if !retained.is_empty() {
            debug!(
                target: "client::writes",
                count = retained.len(),
                "resending pending writes"
            );
        }
        while let Ok(msg) = self.outbound.try_recv() {
            if !retained.contains(&msg) && self.still_pending(&msg) {
                retained.push(msg);
            }
        }
        retained
    }

    fn still_pending(&self, msg: &UpdateMessage) -> bool {
        let (Ok(row), Ok(col)) = (usize::try_from(msg.row), usize::try_from(msg.col)) else {
            return false;
        };
        self.replica
            .read()
            .writes()
            .pending_at(row, col)
            .is_some_and(|pending| i64::from(pending.value.get()) == msg.value)
    }

    /// Apply one inbound payload. Returns the pending writes left unresolved
    /// when the payload was a snapshot.
    fn handle_payload(&mut self, payload: &Payload) -> Option<Vec<UpdateMessage>> {
        let dims = self.decoder.dims();
        let frame = {
            let _perf = telemetry::PerfGuard::new("decode_payload");
            self.decoder.decode(payload)
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                match payload {
                    Payload::Text(text) if !text.trim_start().starts_with('{') => {
                        debug!(target: "client::frame", notice = %text, "server notice");
                        telemetry::record_dropped_frame("notice");
                    }
                    _ => {
                        warn!(
                            target: "client::frame",
                            kind = err.label(),
                            payload = payload.kind(),
                            len = payload.len(),
                            error = %err,
                            "dropping malformed frame"
                        );
                        telemetry::record_dropped_frame(err.label());
                    }
                }
                return None;
            }
        };

        match frame {
            InboundFrame::Snapshot(snapshot) => match self.replica.apply_snapshot(snapshot) {
                Ok(outcome) => {
                    let generation = self.replica.read().snapshot_generation();
                    self.snapshots.send_replace(generation);
                    Some(outcome.writes.retained.iter().map(Delta::to_wire).collect())
                }
                Err(err) => {
                    error!(target: "client::frame", error = %err, "snapshot rejected");
                    telemetry::record_integrity_fault(err.label(), 1);
                    None
                }
            },
            InboundFrame::Update(msg) => {
                let applied =
                    Delta::from_wire(&msg, dims).and_then(|delta| self.replica.apply_delta(&delta));
                if let Err(err) = applied {
                    error!(
                        target: "client::frame",
                        row = msg.row,
                        col = msg.col,
                        value = msg.value,
                        error = %err,
                        "dropping impossible update"
                    );
                    telemetry::record_integrity_fault(err.label(), 1);
                }
                None
            }
        }
    }
}
