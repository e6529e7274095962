//! # helm-cdp
//!
//! Client for a browser's remote debugging protocol.
//!
//! - [`Discovery`]: HTTP `/json` target listing and page management
//! - [`ProtocolClient`]: persistent socket with id-correlated commands,
//!   per-command timeouts, event fan-out, and backoff reconnects

#![deny(unsafe_code)]

pub mod backoff;
pub mod client;
pub mod discovery;
pub mod error;
pub mod types;

pub use client::ProtocolClient;
pub use discovery::{Discovery, select_target};
pub use error::CdpError;
pub use types::{ClientConfig, ClientEvent, TargetInfo};
