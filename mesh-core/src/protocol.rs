//! Meshcall application messages: the JSON action records carried inside envelopes.

use serde::{Deserialize, Serialize};

/// Current protocol version (framing + envelope layout).
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known TCP port every peer listens on.
pub const SIGNALING_PORT: u16 = 10001;

/// Status value announced by a peer that is going away.
pub const STATUS_OFFLINE: &str = "offline";

/// All application messages. Encoded as a JSON object with a required `action` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Message {
    /// Caller asks to start a call; `offer` is the media layer's session description.
    Call { offer: String },
    /// Callee received the call and is alerting the user.
    Ringing,
    /// Callee accepted; `answer` completes the media negotiation.
    Connected { answer: String },
    /// Either side ends or refuses the call.
    Dismissed,
    /// Liveness probe.
    Ping,
    /// Reply to `Ping`.
    Pong,
    /// Presence announcement, e.g. `offline` on shutdown.
    StatusChange {
        #[serde(default)]
        status: String,
    },
    /// Any action this version does not know. Ignored by receivers.
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn offline() -> Self {
        Message::StatusChange {
            status: STATUS_OFFLINE.to_string(),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::Ringing => "ringing",
            Message::Connected { .. } => "connected",
            Message::Dismissed => "dismissed",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::StatusChange { .. } => "status_change",
            Message::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed action record: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shapes() {
        assert_eq!(Message::Ping.to_json().unwrap(), r#"{"action":"ping"}"#);
        assert_eq!(Message::Ringing.to_json().unwrap(), r#"{"action":"ringing"}"#);
        assert_eq!(
            Message::offline().to_json().unwrap(),
            r#"{"action":"status_change","status":"offline"}"#
        );
        assert_eq!(
            Message::Call {
                offer: "v=0".into()
            }
            .to_json()
            .unwrap(),
            r#"{"action":"call","offer":"v=0"}"#
        );
    }

    #[test]
    fn parse_known_actions() {
        assert_eq!(Message::parse(r#"{"action":"pong"}"#).unwrap(), Message::Pong);
        assert_eq!(
            Message::parse(r#"{"offer":"sdp","action":"call"}"#).unwrap(),
            Message::Call {
                offer: "sdp".into()
            }
        );
        assert_eq!(
            Message::parse(r#"{"action":"status_change"}"#).unwrap(),
            Message::StatusChange {
                status: String::new()
            }
        );
    }

    #[test]
    fn unknown_action_is_not_an_error() {
        assert_eq!(
            Message::parse(r#"{"action":"video_toggle","on":true}"#).unwrap(),
            Message::Unknown
        );
    }

    #[test]
    fn malformed_records_rejected() {
        assert!(Message::parse("not json").is_err());
        assert!(Message::parse(r#"{"offer":"sdp"}"#).is_err());
        assert!(Message::parse(r#"{"action":"call"}"#).is_err());
    }
}
