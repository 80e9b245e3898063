//! REST boundary: scan ingest, range queries, and the presence read.

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::info;

use crate::errors::AppResult;
use crate::infra::app_state::AppState;
use crate::infra::websocket::messages::{ChangePlatformData, PairData, ScannerMessage};
use crate::store::{PairEntry, ScanFilter};

/// Ingest payload from a scanning station. A missing `product` marks a
/// platform-change signal rather than a completed scan.
#[derive(Debug, Deserialize)]
pub struct PairDto {
    pub platform: i64,
    pub product: Option<i64>,
    pub timestamp: Option<String>,
}

pub async fn post_scan_data(
    State(state): State<AppState>,
    Json(pair): Json<PairDto>,
) -> AppResult<Json<Value>> {
    let timestamp = pair
        .timestamp
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));

    match pair.product {
        Some(product) => {
            info!(platform = pair.platform, product, "pair received");

            // The insert fully commits before the broadcast fires; on a
            // storage failure the caller sees the error and no broadcast.
            let scan_id = state.store.add_scan(pair.platform, product).await?;

            state
                .manager
                .broadcast(&ScannerMessage::NewPair {
                    data: PairData {
                        platform: pair.platform,
                        product,
                        timestamp,
                    },
                })
                .await;

            Ok(Json(json!({
                "status": "success",
                "message": "scan recorded",
                "id": scan_id,
            })))
        }
        None => {
            info!(platform = pair.platform, "platform change received");

            let pairs = state
                .store
                .pairs_for_day(pair.platform, &today())
                .await?;
            let mut by_platform = BTreeMap::new();
            by_platform.insert(pair.platform, pairs);

            state
                .manager
                .broadcast(&ScannerMessage::ChangePlatform {
                    data: ChangePlatformData {
                        platform: pair.platform,
                        pairs: Some(by_platform),
                    },
                })
                .await;

            Ok(Json(json!({
                "status": "partial",
                "message": "platform change broadcast",
            })))
        }
    }
}

/// Range query over the scan log: mapping from platform id to its pairs,
/// newest first within each platform.
pub async fn get_scan_data(
    State(state): State<AppState>,
    Query(filter): Query<ScanFilter>,
) -> AppResult<Json<BTreeMap<i64, Vec<PairEntry>>>> {
    let records = state.store.query(&filter).await?;

    let mut by_platform: BTreeMap<i64, Vec<PairEntry>> = BTreeMap::new();
    for record in records {
        by_platform
            .entry(record.platform)
            .or_default()
            .push(PairEntry {
                product: record.product,
                scan_id: record.id,
            });
    }

    Ok(Json(by_platform))
}

/// Presence read: the tracked scanner sessions with derived liveness.
pub async fn get_scanners(State(state): State<AppState>) -> Json<Value> {
    let presence = state.manager.presence();
    Json(json!({
        "scanners": presence.snapshot(Utc::now()),
        "total_scanners": presence.len(),
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
