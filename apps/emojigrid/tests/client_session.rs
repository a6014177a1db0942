mod support;

use std::time::Duration;

use emojigrid_client::GridDims;
use emojigrid_client::client::{
    DisplayCell, GridClient, RejectReason, Viewport, ViewportChange, WriteDecision,
};
use emojigrid_client::protocol::Snapshot;
use emojigrid_client::session::{ConnectionState, ExponentialBackoff, FixedDelay};
use emojigrid_client::telemetry::{self, Category};
use emojigrid_client::transport::{Payload, TransportError};
use emojigrid_client::transport::mock::{MockConnector, MockServer, RemoteEnd};
use grid_proto::UpdateMessage;
use tokio::time::Instant;

use support::{ALREADY_SET, id, next_change_at};

fn spawn_fixed(dims: GridDims) -> (GridClient, MockServer) {
    let (connector, server) = MockConnector::new();
    let client = GridClient::spawn(connector, dims, Box::new(FixedDelay::default()));
    (client, server)
}

async fn accept_with_snapshot(server: &mut MockServer, snapshot: &Snapshot) -> RemoteEnd {
    let remote = server.accept().await.expect("client connects");
    assert!(remote.push_snapshot(snapshot));
    remote
}

#[test_timeout::tokio_timeout_test]
async fn write_is_pending_until_echoed_and_later_deltas_are_ignored() {
    let dims = GridDims::STANDARD;
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    assert_eq!(handle.wait_for_snapshot().await, Some(1));
    assert_eq!(handle.connection_state(), ConnectionState::Connected);

    let mut events = handle.subscribe();
    let decision = handle.request_write(0, 0, id(42)).unwrap();
    assert!(matches!(decision, WriteDecision::Accepted(_)));
    assert_eq!(handle.read(0, 0).unwrap(), 0);
    assert_eq!(handle.cell(0, 0).unwrap(), DisplayCell::Pending(id(42)));
    assert_eq!(remote.next_update().await, Some(UpdateMessage::new(0, 0, 42)));

    assert!(remote.push_update(UpdateMessage::new(0, 0, 42)));
    assert_eq!(
        next_change_at(&mut events, 0, 0).await,
        DisplayCell::Placed(id(42))
    );
    assert!(handle.replica().read().writes().is_empty());

    // A later delta for the same cell is a no-op; the marker write orders it.
    assert!(remote.push_update(UpdateMessage::new(0, 0, 7)));
    assert!(remote.push_update(UpdateMessage::new(1, 1, 3)));
    assert_eq!(
        next_change_at(&mut events, 1, 1).await,
        DisplayCell::Placed(id(3))
    );
    assert_eq!(handle.read(0, 0).unwrap(), 42);

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn losing_a_race_adopts_the_server_value() {
    let dims = GridDims::new(10, 10);
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    handle.wait_for_snapshot().await;

    let mut events = handle.subscribe();
    handle.request_write(5, 5, id(10)).unwrap();
    assert_eq!(remote.next_update().await, Some(UpdateMessage::new(5, 5, 10)));

    remote.push_update(UpdateMessage::new(5, 5, 99));
    remote.push_text(ALREADY_SET);
    assert_eq!(next_change_at(&mut events, 5, 5).await, DisplayCell::Pending(id(10)));
    assert_eq!(next_change_at(&mut events, 5, 5).await, DisplayCell::Placed(id(99)));
    assert_eq!(handle.read(5, 5).unwrap(), 99);
    assert!(handle.replica().read().writes().pending_at(5, 5).is_none());

    assert_eq!(
        handle.request_write(5, 5, id(11)).unwrap(),
        WriteDecision::Rejected(RejectReason::Occupied { existing: id(99) })
    );

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_are_dropped_and_the_session_continues() {
    let dims = GridDims::new(4, 4);
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    handle.wait_for_snapshot().await;
    let mut events = handle.subscribe();
    let dropped_before = telemetry::total(Category::DroppedFrame);

    remote.push_text("not json");
    remote.push_text(r#"{"row":1,"col":1}"#);
    remote.push(Payload::Binary(vec![0; 7]));
    remote.push_update(UpdateMessage::new(9, 9, 5));
    remote.push_update(UpdateMessage::new(2, 2, 5));

    assert_eq!(next_change_at(&mut events, 2, 2).await, DisplayCell::Placed(id(5)));
    assert!(telemetry::total(Category::DroppedFrame) >= dropped_before + 3);
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    assert_eq!(handle.replica().read().store().occupied(), 1);

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn reconnect_applies_fresh_snapshot_and_resends_pending_writes() {
    tokio::time::pause();
    let dims = GridDims::new(8, 8);
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    handle.wait_for_snapshot().await;

    handle.request_write(2, 3, id(5)).unwrap();
    assert_eq!(remote.next_update().await, Some(UpdateMessage::new(2, 3, 5)));
    remote.hang_up();
    assert!(handle.wait_for_state(ConnectionState::Disconnected).await);
    let lost_at = Instant::now();

    // Accepted while offline; it waits for the next session.
    assert!(matches!(
        handle.request_write(4, 4, id(6)).unwrap(),
        WriteDecision::Accepted(_)
    ));

    let mut fresh = Snapshot::empty(dims);
    fresh.set(2, 3, 5).unwrap();
    fresh.set(7, 7, 1).unwrap();
    let mut remote = accept_with_snapshot(&mut server, &fresh).await;
    assert!(lost_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(server.attempts(), 2);
    assert_eq!(handle.wait_for_snapshot_after(1).await, Some(2));

    assert_eq!(handle.cell(2, 3).unwrap(), DisplayCell::Placed(id(5)));
    assert_eq!(handle.cell(7, 7).unwrap(), DisplayCell::Placed(id(1)));
    assert_eq!(handle.cell(4, 4).unwrap(), DisplayCell::Pending(id(6)));
    assert_eq!(remote.next_update().await, Some(UpdateMessage::new(4, 4, 6)));

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn refused_connection_is_retried_after_the_fixed_delay() {
    tokio::time::pause();
    let dims = GridDims::new(2, 2);
    let (connector, mut server) = MockConnector::new();
    server.refuse_next(TransportError::Connect {
        endpoint: "mock://grid".into(),
        reason: "refused".into(),
    });
    let started = Instant::now();
    let client = GridClient::spawn(connector, dims, Box::new(FixedDelay::default()));
    let handle = client.handle();

    let _remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(server.attempts(), 2);
    assert!(handle.wait_for_state(ConnectionState::Connected).await);

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn exponential_backoff_grows_between_refusals() {
    tokio::time::pause();
    let dims = GridDims::new(2, 2);
    let (connector, mut server) = MockConnector::new();
    for _ in 0..3 {
        server.refuse_next(TransportError::Closed);
    }
    let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
        .with_jitter(false);
    let started = Instant::now();
    let client = GridClient::spawn(connector, dims, Box::new(policy));

    let _remote = server.accept().await.expect("fourth attempt succeeds");
    assert!(started.elapsed() >= Duration::from_secs(1 + 2 + 4));
    assert_eq!(server.attempts(), 4);

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn transport_error_ends_the_session_and_reconnects() {
    tokio::time::pause();
    let dims = GridDims::new(3, 3);
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    handle.wait_for_snapshot().await;

    remote.fail(TransportError::WebSocket("connection reset".into()));
    assert!(handle.wait_for_state(ConnectionState::Disconnected).await);
    let _remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    assert_eq!(handle.wait_for_snapshot_after(1).await, Some(2));

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn viewport_sees_changes_inside_its_window() {
    let dims = GridDims::STANDARD;
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut projector = handle.projector(Viewport::at(100, 100, 35, 80), 5);
    let remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    handle.wait_for_snapshot().await;
    assert_eq!(projector.changed().await, Some(ViewportChange::Full));

    remote.push_update(UpdateMessage::new(900, 900, 4));
    remote.push_update(UpdateMessage::new(102, 180, 8));
    let Some(ViewportChange::Cells(cells)) = projector.changed().await else {
        panic!("expected a cell change");
    };
    assert_eq!(cells.len(), 1);
    assert_eq!((cells[0].row, cells[0].col), (102, 180));
    assert_eq!(cells[0].cell, DisplayCell::Placed(id(8)));

    client.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_closes_the_transport_and_stops_reconnecting() {
    tokio::time::pause();
    let dims = GridDims::new(2, 2);
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    handle.wait_for_snapshot().await;

    client.shutdown().await;
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    assert_eq!(remote.next_payload().await, None);
    assert_eq!(handle.wait_for_snapshot_after(1).await, None);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.attempts(), 1);
    // Reads keep working on the last known state.
    assert_eq!(handle.read(1, 1).unwrap(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn write_queued_before_the_snapshot_is_sent_once() {
    let dims = GridDims::new(4, 4);
    let (client, mut server) = spawn_fixed(dims);
    let handle = client.handle();
    let mut events = handle.subscribe();
    assert!(matches!(
        handle.request_write(1, 1, id(4)).unwrap(),
        WriteDecision::Accepted(_)
    ));

    let mut remote = accept_with_snapshot(&mut server, &Snapshot::empty(dims)).await;
    assert_eq!(remote.next_update().await, Some(UpdateMessage::new(1, 1, 4)));
    let notices_before = telemetry::counter(Category::DroppedFrame, "notice");
    remote.push_update(UpdateMessage::new(1, 1, 4));
    remote.push_text(ALREADY_SET);
    remote.push_update(UpdateMessage::new(3, 3, 2));
    assert_eq!(next_change_at(&mut events, 3, 3).await, DisplayCell::Placed(id(2)));

    assert_eq!(handle.cell(1, 1).unwrap(), DisplayCell::Placed(id(4)));
    assert!(remote.try_next_payload().is_none());
    assert!(telemetry::counter(Category::DroppedFrame, "notice") > notices_before);

    client.shutdown().await;
}
