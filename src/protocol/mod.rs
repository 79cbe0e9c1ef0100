//! Text-prefixed JSON protocol spoken with the external proxy server.
//!
//! Outbound frames are `"<verb>: <json>"` (`add`, `remove`). Inbound frames
//! are either the literal `ok` or `"<verb>:<json>"`, of which only `stat`
//! carries meaning.

pub mod channel;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::instance::ProxyConfig;

/// Largest datagram read from the control channel.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Reply the server sends once a command has been applied.
pub const ACK: &[u8] = b"ok";

/// 프로토콜 오류 타입
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame has no verb separator: {0:?}")]
    MissingSeparator(String),

    #[error("malformed {verb} payload: {source}")]
    MalformedPayload {
        verb: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {verb} command: {source}")]
    Encode {
        verb: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// What a `remove` command targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RemoveTarget {
    /// Every listener bound to a host. Only used for the startup handshake.
    Host { server: String },
    Port { server_port: u16 },
}

/// Command sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add(ProxyConfig),
    Remove(RemoveTarget),
}

/// Keys an `add` frame writes from typed fields. Never taken from `extra`.
const ADD_KEYS: &[&str] = &[
    "server_port",
    "password",
    "method",
    "auth",
    "one_time_auth",
    "timeout",
    "fast_open",
];

/// Wire form of an `add` request. `auth` is renamed to `one_time_auth`,
/// everything else is carried as-is.
#[derive(Serialize)]
struct AddPayload<'a> {
    server_port: u16,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    one_time_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fast_open: Option<bool>,
    #[serde(flatten)]
    extra: BTreeMap<&'a str, &'a Value>,
}

impl<'a> From<&'a ProxyConfig> for AddPayload<'a> {
    fn from(cfg: &'a ProxyConfig) -> Self {
        let mut extra = BTreeMap::new();
        for (key, value) in &cfg.extra {
            if ADD_KEYS.contains(&key.as_str()) {
                tracing::warn!(
                    "Ignoring extra key {:?} for port {}: it collides with a typed field",
                    key,
                    cfg.server_port
                );
            } else {
                extra.insert(key.as_str(), value);
            }
        }
        Self {
            server_port: cfg.server_port,
            password: &cfg.password,
            method: cfg.method.as_deref(),
            one_time_auth: cfg.auth,
            timeout: cfg.timeout,
            fast_open: cfg.fast_open,
            extra,
        }
    }
}

impl Command {
    pub fn remove_port(port: u16) -> Self {
        Self::Remove(RemoveTarget::Port { server_port: port })
    }

    pub fn remove_host(host: &str) -> Self {
        Self::Remove(RemoveTarget::Host { server: host.to_string() })
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
        }
    }

    /// Serialize to a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let verb = self.verb();
        let body = match self {
            Self::Add(cfg) => serde_json::to_string(&AddPayload::from(cfg)),
            Self::Remove(target) => serde_json::to_string(target),
        }
        .map_err(|source| ProtocolError::Encode { verb, source })?;
        Ok(format!("{}: {}", verb, body).into_bytes())
    }
}

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Ack,
    /// Traffic deltas keyed by listener port.
    Stat(BTreeMap<u16, u64>),
    Unknown { verb: String },
}

/// Decode one inbound datagram.
pub fn decode(frame: &[u8]) -> Result<InboundFrame, ProtocolError> {
    if frame == ACK {
        return Ok(InboundFrame::Ack);
    }

    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    let (verb, payload) = text
        .split_once(':')
        .ok_or_else(|| ProtocolError::MissingSeparator(text.to_string()))?;

    // verb is matched as sent, no trimming
    if verb != "stat" {
        return Ok(InboundFrame::Unknown { verb: verb.to_string() });
    }

    let deltas: BTreeMap<u16, u64> = serde_json::from_str(payload.trim()).map_err(|source| {
        ProtocolError::MalformedPayload {
            verb: verb.to_string(),
            source,
        }
    })?;
    Ok(InboundFrame::Stat(deltas))
}
