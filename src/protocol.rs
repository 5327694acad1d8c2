//! Wire messages exchanged with the management server.
//!
//! Every frame is one JSON object in a WebSocket text frame, tagged by
//! `type`:
//!
//! | type     | direction      | fields                  |
//! |----------|----------------|-------------------------|
//! | `ping`   | agent → server | `mac`                   |
//! | `login`  | server → agent | `mac`, `sid`            |
//! | `logout` | both           | `mac`, `sid`            |
//! | `data`   | both           | `mac`, `sid`, `data`    |
//!
//! `data` carries raw terminal bytes as standard padded base64. Outbound
//! frames always serialize fields in the order shown above.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, ProtocolError};

/// A decoded, validated frame from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Login { sid: String },
    Logout { sid: String },
    /// `data` is still base64; decoding is the handler's job so oversized
    /// payloads can be rejected per session.
    Data { sid: String, data: String },
    /// Server-side `ping`/`pong`. Carries nothing the agent acts on.
    Heartbeat,
}

/// Loose view of an inbound frame; presence checks happen in [`Inbound::parse`].
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    mac: Option<String>,
    sid: Option<String>,
    data: Option<String>,
}

impl Inbound {
    /// Parse and validate one text frame.
    ///
    /// `type` and `mac` are required on every frame; `sid` on `login`,
    /// `logout` and `data`; `data` on `data`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = raw.kind.ok_or(ProtocolError::MissingField("type"))?;
        raw.mac.ok_or(ProtocolError::MissingField("mac"))?;

        let sid = || raw.sid.clone().ok_or(ProtocolError::MissingField("sid"));
        match kind.as_str() {
            "login" => Ok(Self::Login { sid: sid()? }),
            "logout" => Ok(Self::Logout { sid: sid()? }),
            "data" => {
                let sid = sid()?;
                let data = raw.data.ok_or(ProtocolError::MissingField("data"))?;
                Ok(Self::Data { sid, data })
            }
            "ping" | "pong" => Ok(Self::Heartbeat),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// A frame the agent sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Ping { mac: String },
    Data { mac: String, sid: String, data: String },
    Logout { mac: String, sid: String },
}

impl Outbound {
    pub fn ping(mac: &str) -> Self {
        Self::Ping {
            mac: mac.to_string(),
        }
    }

    /// Terminal output for `sid`, base64-encoded.
    pub fn data(mac: &str, sid: &str, bytes: &[u8]) -> Self {
        Self::Data {
            mac: mac.to_string(),
            sid: sid.to_string(),
            data: encode(bytes),
        }
    }

    pub fn logout(mac: &str, sid: &str) -> Self {
        Self::Logout {
            mac: mac.to_string(),
            sid: sid.to_string(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Data { .. } => "data",
            Self::Logout { .. } => "logout",
        }
    }
}

/// Base64-encode terminal bytes.
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Base64-decode a payload, refusing anything that would decode to more than
/// `max` bytes before allocating for it.
pub fn decode(text: &str, max: usize) -> Result<Vec<u8>, CodecError> {
    let estimate = text.len().div_ceil(4) * 3;
    if estimate > max.saturating_add(2) {
        return Err(CodecError::TooLarge {
            size: estimate,
            max,
        });
    }
    let bytes = BASE64.decode(text)?;
    if bytes.len() > max {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max,
        });
    }
    Ok(bytes)
}
