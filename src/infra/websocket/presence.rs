//! Scanner presence derived from heartbeats.
//!
//! A connection becomes a scanner on its first heartbeat frame and stays
//! tracked until it closes. Liveness is a derived predicate recomputed on
//! every read; there is no background poller and no cached active flag, and
//! a stale scanner's connection is never forcibly closed.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dashmap::DashMap;
use tracing::info;

use super::connection::ConnectionId;
use super::messages::ScannerInfo;

/// Age below which a scanner counts as active. Heartbeats re-arm the window.
const LIVENESS_WINDOW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct ScannerSession {
    pub client: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ScannerSession {
    fn new(client: String, now: DateTime<Utc>) -> Self {
        Self {
            client,
            connected_at: now,
            last_heartbeat: now,
        }
    }

    /// Active strictly while the last heartbeat is younger than the window;
    /// at exactly the window boundary the scanner is inactive.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat < Duration::seconds(LIVENESS_WINDOW_SECONDS)
    }
}

/// Tracks which connections have identified themselves as scanners.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    sessions: DashMap<ConnectionId, ScannerSession>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register-or-update for a heartbeat from `conn_id`. Returns `true`
    /// when this heartbeat created the session (a membership change).
    pub fn observe_heartbeat(&self, conn_id: ConnectionId, client: Option<String>) -> bool {
        if let Some(mut session) = self.sessions.get_mut(&conn_id) {
            session.last_heartbeat = Utc::now();
            return false;
        }

        let client = client.unwrap_or_else(|| "unknown".to_string());
        info!(%conn_id, client = %client, "scanner registered");
        self.sessions
            .insert(conn_id, ScannerSession::new(client, Utc::now()));
        true
    }

    /// Drop the session for a closing connection. Returns `true` when a
    /// session actually existed (a membership change).
    pub fn remove(&self, conn_id: ConnectionId) -> bool {
        match self.sessions.remove(&conn_id) {
            Some((_, session)) => {
                info!(%conn_id, client = %session.client, "scanner disconnected");
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// One entry per tracked session, liveness recomputed against `now`.
    /// Iteration order over the tracked set; no registration order promised.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<ScannerInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                ScannerInfo {
                    client: session.client.clone(),
                    connected_at: iso(session.connected_at),
                    last_heartbeat: iso(session.last_heartbeat),
                    is_active: session.is_active_at(now),
                }
            })
            .collect()
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_heartbeat_creates_one_session_and_later_ones_update_it() {
        let presence = PresenceTracker::new();
        let id = ConnectionId(1);

        assert!(presence.observe_heartbeat(id, Some("station-A".into())));
        assert_eq!(presence.len(), 1);
        let first = presence.sessions.get(&id).unwrap().last_heartbeat;

        assert!(!presence.observe_heartbeat(id, Some("station-A".into())));
        assert_eq!(presence.len(), 1);
        let session = presence.sessions.get(&id).unwrap();
        assert!(session.last_heartbeat >= first);
        assert_eq!(session.connected_at, first);
    }

    #[test]
    fn heartbeat_without_client_label_defaults_to_unknown() {
        let presence = PresenceTracker::new();
        presence.observe_heartbeat(ConnectionId(1), None);
        let snapshot = presence.snapshot(Utc::now());
        assert_eq!(snapshot[0].client, "unknown");
    }

    #[test]
    fn liveness_boundary_is_strict_at_sixty_seconds() {
        let now = Utc::now();
        let mut session = ScannerSession::new("station-A".into(), now);

        session.last_heartbeat = now - Duration::milliseconds(59_999);
        assert!(session.is_active_at(now));

        session.last_heartbeat = now - Duration::milliseconds(60_000);
        assert!(!session.is_active_at(now));
    }

    #[test]
    fn remove_reports_membership_changes_only_once() {
        let presence = PresenceTracker::new();
        let id = ConnectionId(3);
        presence.observe_heartbeat(id, Some("station-B".into()));

        assert!(presence.remove(id));
        assert!(!presence.remove(id));
        assert!(presence.is_empty());
    }

    #[test]
    fn snapshot_recomputes_activity_per_read() {
        let presence = PresenceTracker::new();
        let id = ConnectionId(4);
        presence.observe_heartbeat(id, Some("station-C".into()));

        let now = Utc::now();
        assert!(presence.snapshot(now)[0].is_active);
        let later = now + Duration::seconds(61);
        assert!(!presence.snapshot(later)[0].is_active);
    }
}
