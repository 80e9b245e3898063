use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::auth;
use crate::handlers::{handle_websocket, scan_handlers};
use crate::infra::app_state::AppState;

/// Assemble the application router: the WebSocket endpoint (admission is
/// handled inside the upgrade), the bearer-protected REST API, and a
/// liveness probe.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/scan_data",
            post(scan_handlers::post_scan_data).get(scan_handlers::get_scan_data),
        )
        .route("/api/scanners", get(scan_handlers::get_scanners))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(scan_handlers::health))
        .route("/ws", get(handle_websocket::websocket_handler))
        .merge(api)
        .with_state(state)
}
