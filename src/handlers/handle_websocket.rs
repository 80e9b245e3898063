//! WebSocket endpoint: admission, the per-connection writer task, and the
//! receive loop feeding the message router.

use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth;
use crate::handlers::scan_handlers::today;
use crate::infra::app_state::AppState;
use crate::infra::websocket::{
    Connection, OutboundFrame, ScannerMessage, messages::PairData, router,
};
use crate::store::ScanFilter;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Handle the WebSocket upgrade request. Admission happens before any
/// application frame: an unverifiable credential still upgrades, but the
/// socket is closed immediately with a policy-violation status.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let admission = auth::admission_token(&headers, query.token.as_deref())
        .and_then(|token| state.token_verifier.verify(&token));

    match admission {
        Ok(identity) => {
            ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        }
        Err(err) => {
            warn!(%err, "websocket admission refused");
            ws.on_upgrade(refuse_socket)
        }
    }
}

async fn refuse_socket(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static("policy violation"),
        })))
        .await;
}

/// Drive one accepted connection until the transport closes or errors.
async fn handle_socket(socket: WebSocket, state: AppState, identity: String) {
    let Some((connection, mut outbound)) = state.manager.register(&identity) else {
        refuse_socket(socket).await;
        return;
    };
    let conn_id = connection.id;
    info!(%conn_id, identity = %identity, "websocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer task: the only place that touches the sink, so frames from a
    // single broadcast are never interleaved on one connection.
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                OutboundFrame::Text(payload) => {
                    if ws_sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static("server shutdown"),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    send_initial_data(&state, &connection).await;

    while let Some(incoming) = ws_receiver.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                router::dispatch_frame(&state.manager, conn_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => {
                info!(%conn_id, "websocket closed by client");
                break;
            }
            // Control frames and binary payloads carry no application data.
            Ok(_) => {}
            Err(err) => {
                warn!(%conn_id, %err, "websocket transport error");
                break;
            }
        }
    }

    state.manager.teardown(conn_id);
}

/// Replay today's records to a newly accepted connection.
async fn send_initial_data(state: &AppState, connection: &Connection) {
    let filter = ScanFilter {
        date: Some(today()),
        ..ScanFilter::default()
    };

    let records = match state.store.query(&filter).await {
        Ok(records) => records,
        Err(err) => {
            warn!(conn_id = %connection.id, %err, "initial data query failed");
            return;
        }
    };

    let data: Vec<PairData> = records
        .into_iter()
        .map(|r| PairData {
            platform: r.platform,
            product: r.product,
            timestamp: r.scan_date,
        })
        .collect();
    let total_pairs = data.len();

    info!(conn_id = %connection.id, total_pairs, "sending initial data");
    let message = ScannerMessage::InitialData { data, total_pairs };
    if let Err(err) = connection.send_message(&message).await {
        warn!(conn_id = %connection.id, %err, "initial data undeliverable");
    }
}
