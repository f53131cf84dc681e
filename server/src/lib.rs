//! Agent Console server: axum router, REST handlers, WebSocket channels.

pub mod web_server;
pub mod ws;
