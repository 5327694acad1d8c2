//! Transport to the management server.
//!
//! The agent dials out over a single WebSocket; [`client`] owns that
//! connection, its reconnect policy and the frames flowing over it.

pub mod client;
