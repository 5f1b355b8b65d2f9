//! Database wire protocols spoken by the relay.

pub mod mysql;
