//! Error types, one enum per concern.
//!
//! Only [`ConfigError`], [`DeviceError`], [`LoginError`] and the transport
//! errors wrapped by [`AgentError`] ever end the process. Everything raised
//! while handling a frame or a session is logged and dropped by the handler.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration could not be loaded or is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The device identity could not be resolved from the network interface.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid interface name {0:?}")]
    InvalidInterface(String),

    #[error("cannot read hardware address of {ifname}: {source}")]
    Unreadable {
        ifname: String,
        source: std::io::Error,
    },

    #[error("interface {ifname} has no usable hardware address ({address:?})")]
    NoAddress { ifname: String, address: String },
}

/// The login program could not be located.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("The program 'login' is not found")]
    NotFound,

    #[error("configured login program {0} is not an executable file")]
    NotExecutable(PathBuf),
}

/// Base64 payload could not be turned back into bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload of ~{size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("malformed base64 payload: {0}")]
    Malformed(#[from] base64::DecodeError),
}

/// An inbound frame that cannot be acted on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object of string fields: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown frame type {0:?}")]
    UnknownType(String),
}

/// Failure to create or drive a PTY session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("pseudo-terminal allocation failed: {0}")]
    Pty(#[from] nix::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("pseudo-terminal setup failed: {0}")]
    Setup(std::io::Error),

    #[error("session input queue is closed")]
    InputClosed,

    #[error("session input queue is full")]
    InputFull,
}

/// One connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("websocket handshake failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A frame could not be put on the transport.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket send failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Reasons the event loop stops with a failure.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cannot connect to server: {0}")]
    Connect(#[from] ConnectError),

    #[error("connection to server closed")]
    Closed,
}
