//! Signaling message envelopes
//!
//! Every frame on a channel is a JSON object tagged by `kind`. Offer, answer
//! and candidate payloads are carried as opaque JSON values and forwarded
//! verbatim; only the envelope is validated here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The two roles a channel can hold in a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Receives and displays the remote stream.
    #[serde(alias = "browser")]
    Viewer,
    /// Captures and sends the stream.
    #[serde(alias = "phone")]
    Source,
}

impl Role {
    /// The role on the other end of the session.
    pub fn peer(self) -> Role {
        match self {
            Role::Viewer => Role::Source,
            Role::Source => Role::Viewer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Source => "source",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientMessage {
    RoleRegister { role: Role },
    Offer { payload: Value },
    Answer { payload: Value },
    Candidate { payload: Value },
    SessionReset,
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerMessage {
    Offer {
        payload: Value,
    },
    Answer {
        payload: Value,
    },
    Candidate {
        payload: Value,
    },
    SessionReset,
    SessionBusy,
    IpChanged {
        #[serde(rename = "newAddress")]
        new_address: String,
    },
    RoleRegistered {
        role: Role,
        #[serde(rename = "viewerBound")]
        viewer_bound: bool,
        #[serde(rename = "sourceBound")]
        source_bound: bool,
    },
    Error {
        reason: String,
    },
}

impl ServerMessage {
    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> String {
        // Every variant is a plain object of strings, bools and JSON values,
        // none of which can fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Candidate { .. } => "candidate",
            ServerMessage::SessionReset => "session-reset",
            ServerMessage::SessionBusy => "session-busy",
            ServerMessage::IpChanged { .. } => "ip-changed",
            ServerMessage::RoleRegistered { .. } => "role-registered",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Kinds a client is allowed to send. Anything else is ignored.
const CLIENT_KINDS: [&str; 5] = [
    "role-register",
    "offer",
    "answer",
    "candidate",
    "session-reset",
];

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(ClientMessage),
    /// A well-formed envelope of a kind this relay does not handle.
    Ignored(String),
}

/// Why an inbound frame was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    NotJson(String),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("message has no string `kind` field")]
    MissingKind,
    #[error("invalid `{kind}` message: {reason}")]
    InvalidBody { kind: String, reason: String },
    #[error("`{0}` message has a null payload")]
    NullPayload(String),
}

/// Decode a raw frame into a client message.
///
/// Unknown kinds decode to [`Decoded::Ignored`]; only known kinds with a bad
/// body are errors.
pub fn decode(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::NotJson(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match object.get("kind") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingKind),
    };

    if !CLIENT_KINDS.contains(&kind.as_str()) {
        return Ok(Decoded::Ignored(kind));
    }

    let carries_payload = matches!(kind.as_str(), "offer" | "answer" | "candidate");
    if carries_payload && matches!(object.get("payload"), Some(Value::Null)) {
        return Err(DecodeError::NullPayload(kind));
    }

    serde_json::from_value(value)
        .map(Decoded::Message)
        .map_err(|e| DecodeError::InvalidBody {
            kind,
            reason: e.to_string(),
        })
}
