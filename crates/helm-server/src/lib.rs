//! # helm-server
//!
//! Axum HTTP + WebSocket surface for observers:
//!
//! - [`websocket::hub::EventHub`]: connection registry, subscription
//!   filtering, heartbeat sweeps, and shutdown
//! - [`websocket::session::run_ws_session`]: per-socket read/write loops
//! - [`websocket::event_bridge::EventBridge`]: forwards bus events to the hub
//! - [`server::HelmServer`]: `/ws` upgrade and `/health`

#![deny(unsafe_code)]

pub mod error;
pub mod health;
pub mod server;
pub mod websocket;

pub use error::ServerError;
pub use server::HelmServer;
pub use websocket::connection::{ClientConnection, Outbound};
pub use websocket::event_bridge::EventBridge;
pub use websocket::hub::EventHub;
pub use websocket::protocol::ControlMessage;
