//! Inbound frame parsing and dispatch.

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use super::connection::ConnectionId;
use super::manager::ConnectionManager;
use super::messages::ScannerMessage;

/// Parse one raw text frame from `conn_id` and dispatch it.
///
/// A malformed frame is logged and dropped; the connection always survives.
/// Unrecognized kinds are ignored so newer clients keep working against
/// older servers.
pub async fn dispatch_frame(manager: &ConnectionManager, conn_id: ConnectionId, raw: &str) {
    let message: ScannerMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(%conn_id, %err, "dropping malformed frame");
            return;
        }
    };

    match message {
        ScannerMessage::Heartbeat { client, .. } => {
            info!(%conn_id, client = client.as_deref().unwrap_or("unknown"), "heartbeat");
            manager.observe_heartbeat(conn_id, client);

            // Ack goes to the originating connection only, never broadcast.
            let ack = ScannerMessage::HeartbeatAck {
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            };
            match manager.get(conn_id) {
                Some(connection) => {
                    if let Err(err) = connection.send_message(&ack).await {
                        warn!(%conn_id, %err, "heartbeat ack undeliverable");
                        manager.teardown(conn_id);
                    }
                }
                None => debug!(%conn_id, "heartbeat from unregistered connection"),
            }
        }

        // Server-originated kinds arriving inbound are not errors; log for
        // observability and move on.
        ScannerMessage::HeartbeatAck { .. }
        | ScannerMessage::NewPair { .. }
        | ScannerMessage::ChangePlatform { .. }
        | ScannerMessage::ScannerStatus { .. }
        | ScannerMessage::InitialData { .. } => {
            debug!(%conn_id, "ignoring server-only message kind from client");
        }

        ScannerMessage::Unknown => {
            debug!(%conn_id, "ignoring unrecognized message kind");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::websocket::connection::OutboundFrame;
    use crate::infra::websocket::manager::run_status_loop;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next_text(rx: &mut mpsc::Receiver<OutboundFrame>) -> String {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(OutboundFrame::Text(payload))) => payload.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_acks_sender_and_notifies_others() {
        let (manager, events) = ConnectionManager::new();
        tokio::spawn(run_status_loop(manager.clone(), events));

        let (scanner, mut scanner_rx) = manager.register("scanner").unwrap();
        let (_observer, mut observer_rx) = manager.register("observer").unwrap();

        dispatch_frame(
            &manager,
            scanner.id,
            r#"{"type":"heartbeat","client":"station-A"}"#,
        )
        .await;

        // Sender gets the ack directly.
        let ack: serde_json::Value =
            serde_json::from_str(&next_text(&mut scanner_rx).await).unwrap();
        assert_eq!(ack["type"], "heartbeat_ack");
        assert!(ack["timestamp"].is_string());

        // Every other client sees the membership change.
        let status: serde_json::Value =
            serde_json::from_str(&next_text(&mut observer_rx).await).unwrap();
        assert_eq!(status["type"], "scanner_status");
        assert_eq!(status["scanners"][0]["client"], "station-A");
        assert_eq!(status["scanners"][0]["is_active"], true);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_connection_survives() {
        let (manager, _events) = ConnectionManager::new();
        let (conn, mut rx) = manager.register("observer").unwrap();

        dispatch_frame(&manager, conn.id, "{not json").await;

        assert!(manager.get(conn.id).is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored() {
        let (manager, _events) = ConnectionManager::new();
        let (conn, mut rx) = manager.register("observer").unwrap();

        dispatch_frame(&manager, conn.id, r#"{"type":"new_scan","data":{}}"#).await;

        assert!(manager.get(conn.id).is_some());
        assert!(rx.try_recv().is_err());
        assert!(manager.presence().is_empty());
    }

    #[tokio::test]
    async fn second_heartbeat_does_not_duplicate_the_session() {
        let (manager, _events) = ConnectionManager::new();
        let (conn, mut rx) = manager.register("scanner").unwrap();

        dispatch_frame(
            &manager,
            conn.id,
            r#"{"type":"heartbeat","client":"station-A"}"#,
        )
        .await;
        dispatch_frame(
            &manager,
            conn.id,
            r#"{"type":"heartbeat","client":"station-A"}"#,
        )
        .await;

        assert_eq!(manager.presence().len(), 1);
        // Two acks, one per heartbeat.
        assert!(next_text(&mut rx).await.contains("heartbeat_ack"));
        assert!(next_text(&mut rx).await.contains("heartbeat_ack"));
    }
}
