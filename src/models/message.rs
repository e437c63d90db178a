//! EventSub WebSocket messages, classified by `metadata.message_type`.

use crate::error::{AppError, AppResult};
use crate::json::JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub enum EventSubMessage {
    /// First message on a new connection; carries the session id.
    Welcome { session_id: String },
    Notification {
        subscription_type: String,
        event: JsonValue,
    },
    Revocation {
        subscription_type: String,
        status: String,
    },
    Keepalive,
    /// The server asks the client to move to a new connection.
    Reconnect { reconnect_url: Option<String> },
    Unknown { message_type: String },
}

fn required_str<'a>(root: &'a JsonValue, path: &[&str]) -> AppResult<&'a str> {
    root.get_path(path)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| AppError::MissingField(path.join(".")))
}

fn required_object<'a>(root: &'a JsonValue, path: &[&str]) -> AppResult<&'a JsonValue> {
    root.get_path(path)
        .filter(|v| v.as_object().is_some())
        .ok_or_else(|| AppError::MissingField(path.join(".")))
}

impl EventSubMessage {
    pub fn from_json(root: &JsonValue) -> AppResult<Self> {
        if root.as_object().is_none() {
            return Err(AppError::MissingField(format!(
                "message root must be an object, got {}",
                root.kind()
            )));
        }
        let message_type = required_str(root, &["metadata", "message_type"])?;
        let message = match message_type {
            "session_welcome" => EventSubMessage::Welcome {
                session_id: required_str(root, &["payload", "session", "id"])?.to_string(),
            },
            "notification" => EventSubMessage::Notification {
                subscription_type: required_str(root, &["payload", "subscription", "type"])?
                    .to_string(),
                event: required_object(root, &["payload", "event"])?.clone(),
            },
            "revocation" => EventSubMessage::Revocation {
                subscription_type: required_str(root, &["payload", "subscription", "type"])?
                    .to_string(),
                status: root
                    .get_path(&["payload", "subscription", "status"])
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "keepalive" | "session_keepalive" => EventSubMessage::Keepalive,
            "session_reconnect" => EventSubMessage::Reconnect {
                reconnect_url: root
                    .get_path(&["payload", "session", "reconnect_url"])
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            },
            other => EventSubMessage::Unknown {
                message_type: other.to_string(),
            },
        };
        Ok(message)
    }

    pub fn name(&self) -> &str {
        match self {
            EventSubMessage::Welcome { .. } => "session_welcome",
            EventSubMessage::Notification { .. } => "notification",
            EventSubMessage::Revocation { .. } => "revocation",
            EventSubMessage::Keepalive => "session_keepalive",
            EventSubMessage::Reconnect { .. } => "session_reconnect",
            EventSubMessage::Unknown { message_type } => message_type,
        }
    }
}
