#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! rtty library — the building blocks of the device agent.
//!
//! - `agent` — the event loop tying everything together
//! - `config` — configuration loading
//! - `device` — device identity
//! - `protocol` — wire messages and payload codec
//! - `handler` — protocol dispatch against the session table
//! - `sessions` — PTY session lifecycle
//! - `shell` — login lookup and PTY plumbing
//! - `tunnel` — the WebSocket connection to the server

pub mod agent;
pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod sessions;
pub mod shell;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use handler::Handler;
pub use sessions::{PtySession, PtySpawner, SessionTable};
