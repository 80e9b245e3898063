//! Wire-level message shapes for the persistent connection.
//!
//! One JSON object per text frame, discriminated by a `type` tag. The enum
//! is closed: dispatch matches exhaustively, and frames with an unknown tag
//! land on [`ScannerMessage::Unknown`] so forward-compatible clients never
//! error a connection.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::store::PairEntry;

#[derive(Debug, Error)]
#[error("failed to encode outbound frame: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScannerMessage {
    /// Periodic liveness frame from a scanning station.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<String>,
    },
    /// Ack sent back to the heartbeat's sender only.
    HeartbeatAck { timestamp: String },
    /// A freshly persisted scan, broadcast to every observer.
    NewPair { data: PairData },
    /// Active-platform change, broadcast with that platform's pairs for today.
    ChangePlatform { data: ChangePlatformData },
    /// Presence snapshot, broadcast whenever scanner membership changes.
    ScannerStatus {
        scanners: Vec<ScannerInfo>,
        has_active_scanners: bool,
        timestamp: String,
    },
    /// Today's records, replayed once to a newly accepted connection.
    InitialData {
        data: Vec<PairData>,
        total_pairs: usize,
    },
    /// Any unrecognized tag. Logged and ignored, never an error.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairData {
    pub platform: i64,
    pub product: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlatformData {
    pub platform: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<BTreeMap<i64, Vec<PairEntry>>>,
}

/// One tracked scanner session as observers see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerInfo {
    pub client: String,
    pub connected_at: String,
    pub last_heartbeat: String,
    pub is_active: bool,
}

/// Serialize a message into the text frame payload. Broadcast serializes
/// once and hands cheap clones of the resulting bytes to every connection.
pub fn encode(message: &ScannerMessage) -> Result<Utf8Bytes, EncodeError> {
    Ok(Utf8Bytes::from(serde_json::to_string(message)?))
}
