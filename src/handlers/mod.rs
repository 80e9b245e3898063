pub mod handle_websocket;
pub mod scan_handlers;
