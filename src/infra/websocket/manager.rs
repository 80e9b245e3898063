//! Live connection registry and broadcast fan-out.
//!
//! The manager owns every open connection, keyed by the integer id assigned
//! at accept time. Broadcast serializes a message once and attempts delivery
//! to each member; a failing member never blocks the pass and is torn down
//! only after the pass completes. Presence membership changes are pushed
//! onto an explicit event queue drained by [`run_status_loop`], so status
//! broadcasts never run inside the mutation that triggered them and a
//! failed enqueue is observable in the logs.

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionId, OutboundFrame};
use super::messages::{self, ScannerMessage};
use super::presence::PresenceTracker;

/// Capacity of each connection's outbound frame queue.
const OUTBOUND_QUEUE_DEPTH: usize = 100;

/// Events drained by the status loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    /// Scanner membership changed; observers need a fresh snapshot.
    ScannerStatusChanged,
}

pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    presence: PresenceTracker,
    next_id: AtomicU64,
    /// Cleared once shutdown begins; no registration is accepted after.
    accepting: AtomicBool,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_count", &self.connections.len())
            .field("scanner_count", &self.presence.len())
            .finish()
    }
}

impl ConnectionManager {
    /// Build the manager plus the event queue receiver that
    /// [`run_status_loop`] drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            connections: DashMap::new(),
            presence: PresenceTracker::new(),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            events,
        });
        (manager, events_rx)
    }

    /// Register a freshly admitted connection, assigning it an id and an
    /// outbound queue. Returns `None` once shutdown has begun.
    pub fn register(
        &self,
        identity: &str,
    ) -> Option<(Arc<Connection>, mpsc::Receiver<OutboundFrame>)> {
        if !self.accepting.load(Ordering::Acquire) {
            warn!(identity, "rejecting connection: shutting down");
            return None;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let connection = Arc::new(Connection::new(id, identity.to_string(), tx));
        self.connections.insert(id, connection.clone());

        info!(%id, identity, total = self.connections.len(), "connection registered");
        Some((connection, rx))
    }

    /// Unregister a connection from the registry and presence. Idempotent:
    /// transports signal closure through several paths, and tearing down an
    /// already-absent connection is a no-op.
    pub fn teardown(&self, conn_id: ConnectionId) {
        if self.connections.remove(&conn_id).is_some() {
            info!(%conn_id, total = self.connections.len(), "connection closed");
        }
        if self.presence.remove(conn_id) {
            self.notify_status_changed();
        }
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&conn_id).map(|c| c.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Register-or-update presence for a heartbeat. A first heartbeat is a
    /// membership change and schedules a status broadcast.
    pub fn observe_heartbeat(&self, conn_id: ConnectionId, client: Option<String>) {
        if self.presence.observe_heartbeat(conn_id, client) {
            self.notify_status_changed();
        }
    }

    /// Send `message` to every registered connection. The payload is
    /// serialized once; a failed member is collected during the pass and
    /// torn down only after it completes, so one bad transport never
    /// affects delivery to the rest, and nothing propagates to the caller.
    pub async fn broadcast(&self, message: &ScannerMessage) {
        let payload = match messages::encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "dropping broadcast");
                return;
            }
        };

        // Snapshot the membership; the live map is never mutated mid-pass.
        let targets: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();

        let mut failed = Vec::new();
        for connection in targets {
            if let Err(err) = connection.send_text(payload.clone()).await {
                warn!(%err, "broadcast delivery failed");
                failed.push(connection.id);
            }
        }

        for conn_id in failed {
            self.teardown(conn_id);
        }
    }

    /// Broadcast the current presence snapshot to every observer.
    pub async fn broadcast_scanner_status(&self) {
        let now = Utc::now();
        let scanners = self.presence.snapshot(now);
        let has_active_scanners = scanners.iter().any(|s| s.is_active);

        self.broadcast(&ScannerMessage::ScannerStatus {
            scanners,
            has_active_scanners,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, true),
        })
        .await;
    }

    /// Graceful shutdown: stop accepting registrations, ask every writer to
    /// close its transport, then clear all tracked state regardless of
    /// individual close outcomes.
    pub async fn close_all(&self) {
        self.accepting.store(false, Ordering::Release);
        info!(total = self.connections.len(), "closing all connections");

        let targets: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for connection in targets {
            connection.close().await;
        }

        self.connections.clear();
        self.presence.clear();
    }

    fn notify_status_changed(&self) {
        if self.events.send(HubEvent::ScannerStatusChanged).is_err() {
            warn!("status event queue closed; scanner_status broadcast lost");
        }
    }
}

/// Drain the status event queue, turning each membership change into a
/// `scanner_status` broadcast. Runs until the manager is dropped.
pub async fn run_status_loop(
    manager: Arc<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            HubEvent::ScannerStatusChanged => manager.broadcast_scanner_status().await,
        }
    }
    debug!("status event queue drained; loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_text(rx: &mut mpsc::Receiver<OutboundFrame>) -> String {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(OutboundFrame::Text(payload))) => payload.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (manager, _events) = ConnectionManager::new();
        let (conn, _rx) = manager.register("observer").unwrap();
        assert_eq!(manager.connection_count(), 1);

        manager.teardown(conn.id);
        manager.teardown(conn.id);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_isolates_a_failed_connection() {
        let (manager, _events) = ConnectionManager::new();
        let (_a, mut rx_a) = manager.register("a").unwrap();
        let (b, rx_b) = manager.register("b").unwrap();
        let (_c, mut rx_c) = manager.register("c").unwrap();

        // Simulate a dead transport: its writer side is gone.
        drop(rx_b);

        manager
            .broadcast(&ScannerMessage::HeartbeatAck {
                timestamp: "now".into(),
            })
            .await;

        assert!(next_text(&mut rx_a).await.contains("heartbeat_ack"));
        assert!(next_text(&mut rx_c).await.contains("heartbeat_ack"));
        assert_eq!(manager.connection_count(), 2);
        assert!(manager.get(b.id).is_none());
    }

    #[tokio::test]
    async fn first_heartbeat_schedules_a_status_event_updates_do_not() {
        let (manager, mut events) = ConnectionManager::new();
        let (conn, _rx) = manager.register("station").unwrap();

        manager.observe_heartbeat(conn.id, Some("station-A".into()));
        assert_eq!(
            events.try_recv().ok(),
            Some(HubEvent::ScannerStatusChanged)
        );

        manager.observe_heartbeat(conn.id, Some("station-A".into()));
        assert!(events.try_recv().is_err());

        manager.teardown(conn.id);
        assert_eq!(
            events.try_recv().ok(),
            Some(HubEvent::ScannerStatusChanged)
        );
    }

    #[tokio::test]
    async fn scanner_status_snapshot_reaches_observers() {
        let (manager, _events) = ConnectionManager::new();
        let (scanner, _scanner_rx) = manager.register("scanner").unwrap();
        let (_observer, mut observer_rx) = manager.register("observer").unwrap();

        manager.observe_heartbeat(scanner.id, Some("station-A".into()));
        manager.broadcast_scanner_status().await;

        let payload = next_text(&mut observer_rx).await;
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "scanner_status");
        assert_eq!(value["scanners"][0]["client"], "station-A");
        assert_eq!(value["has_active_scanners"], true);
    }

    #[tokio::test]
    async fn close_all_clears_state_and_refuses_new_registrations() {
        let (manager, _events) = ConnectionManager::new();
        let (scanner, _rx1) = manager.register("scanner").unwrap();
        let (_observer, mut rx2) = manager.register("observer").unwrap();
        manager.observe_heartbeat(scanner.id, Some("station-A".into()));

        manager.close_all().await;

        assert_eq!(manager.connection_count(), 0);
        assert!(manager.presence().is_empty());
        assert!(matches!(
            timeout(Duration::from_secs(1), rx2.recv()).await,
            Ok(Some(OutboundFrame::Close))
        ));
        assert!(manager.register("late").is_none());
    }

    #[tokio::test]
    async fn status_loop_broadcasts_on_membership_change() {
        let (manager, events) = ConnectionManager::new();
        tokio::spawn(run_status_loop(manager.clone(), events));

        let (scanner, _scanner_rx) = manager.register("scanner").unwrap();
        let (_observer, mut observer_rx) = manager.register("observer").unwrap();

        manager.observe_heartbeat(scanner.id, Some("station-A".into()));

        let payload = next_text(&mut observer_rx).await;
        assert!(payload.contains("scanner_status"));
        assert!(payload.contains("station-A"));
    }
}
