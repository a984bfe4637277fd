//! Chat envelopes carried in WebSocket text frames.
//!
//! Inbound traffic is loosely shaped JSON:
//! `{"connectionId": "7", "type": "auth" | "to-person" | <other>, "userId"?, "toUserId"?, "chatMessage"?, "token"?}`.
//! It is decided into a tagged [`Envelope`] once, at decode time. Outbound
//! traffic is the closed set in [`ServerMessage`].

use crate::error::ChatResult;
use crate::frame::{self, OpCode};
use serde::{Deserialize, Deserializer, Serialize};

/// Wire shape of an inbound message. Ids may arrive as strings or numbers.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    connection_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    to_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chat_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A decoded inbound message.
///
/// `connection_id` is the connection the client *claims* to speak for. The
/// server decides how far to trust it; it is never required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Attach `user_id` to a connection.
    Auth {
        connection_id: Option<String>,
        user_id: String,
        token: Option<String>,
    },
    /// Deliver `chat_message` to whoever is logged in as `to_user_id`.
    ToPerson {
        connection_id: Option<String>,
        to_user_id: String,
        chat_message: String,
    },
    /// Anything else.
    Generic {
        connection_id: Option<String>,
        chat_message: Option<String>,
    },
}

impl Envelope {
    /// Decode a text message. Never fails: text that is not a JSON object,
    /// an unknown `type`, or a known `type` missing its required field all
    /// become [`Envelope::Generic`].
    pub fn parse(text: &str) -> Envelope {
        let raw: RawEnvelope = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(_) => {
                return Envelope::Generic {
                    connection_id: None,
                    chat_message: Some(text.to_string()),
                };
            }
        };

        match (raw.kind.as_deref(), raw.user_id, raw.to_user_id) {
            (Some("auth"), Some(user_id), _) if !user_id.is_empty() => Envelope::Auth {
                connection_id: raw.connection_id,
                user_id,
                token: raw.token,
            },
            (Some("to-person"), _, Some(to_user_id)) if !to_user_id.is_empty() => {
                Envelope::ToPerson {
                    connection_id: raw.connection_id,
                    to_user_id,
                    chat_message: raw.chat_message.unwrap_or_default(),
                }
            }
            _ => Envelope::Generic {
                connection_id: raw.connection_id,
                chat_message: raw.chat_message,
            },
        }
    }

    /// The claimed connection id, if any.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Envelope::Auth { connection_id, .. }
            | Envelope::ToPerson { connection_id, .. }
            | Envelope::Generic { connection_id, .. } => connection_id.as_deref(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Auth { .. } => "auth",
            Envelope::ToPerson { .. } => "to-person",
            Envelope::Generic { .. } => "generic",
        }
    }

    /// Client-side encoding.
    pub fn to_json(&self) -> ChatResult<String> {
        let raw = match self.clone() {
            Envelope::Auth {
                connection_id,
                user_id,
                token,
            } => RawEnvelope {
                connection_id,
                kind: Some("auth".into()),
                user_id: Some(user_id),
                token,
                ..Default::default()
            },
            Envelope::ToPerson {
                connection_id,
                to_user_id,
                chat_message,
            } => RawEnvelope {
                connection_id,
                kind: Some("to-person".into()),
                to_user_id: Some(to_user_id),
                chat_message: Some(chat_message),
                ..Default::default()
            },
            Envelope::Generic {
                connection_id,
                chat_message,
            } => RawEnvelope {
                connection_id,
                kind: Some("message".into()),
                chat_message,
                ..Default::default()
            },
        };
        Ok(serde_json::to_string(&raw)?)
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// The connection must authenticate; tells the client its own id.
    AuthRequired { connection_id: String },
    /// An `auth` envelope was refused.
    AuthFailed { connection_id: String, reason: String },
    /// A direct message was relayed. Sent to both recipient and sender.
    Delivered {
        chat_message: String,
        from_user_id: String,
        to_user_id: String,
    },
    /// The addressed user has no live connection.
    NotOnline { to_user_id: String },
    /// Acknowledges a generic message from an authenticated connection.
    Ack { chat_message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> ChatResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> ChatResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as an unmasked text frame.
    pub fn to_frame(&self) -> ChatResult<Vec<u8>> {
        Ok(frame::encode(OpCode::Text, self.to_json()?.as_bytes()))
    }
}
