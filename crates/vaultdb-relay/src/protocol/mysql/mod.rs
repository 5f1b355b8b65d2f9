//! MySQL protocol implementation
//!
//! This module provides:
//! - Packet structures, capability flags and the framing codec
//! - Authentication helpers (native password, caching_sha2)
//! - The server side of the connection phase ([`server`])
//! - The client side used to reach backends ([`client`])

pub mod auth;
pub mod client;
pub mod packets;
pub mod parser;
pub mod server;

pub use client::{BackendConn, ConnectOptions};
pub use packets::*;
pub use server::{ClientHandshake, HandshakeSetup, ServerConn, ServerSettings};
