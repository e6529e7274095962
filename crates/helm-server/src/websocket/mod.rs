//! WebSocket observer surface.

pub mod connection;
pub mod event_bridge;
pub mod heartbeat;
pub mod hub;
pub mod protocol;
pub mod session;
