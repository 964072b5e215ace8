//! Messages exchanged between the dashboard and the console views it opened.
//!
//! Delivery is best-effort: a message may be lost, duplicated or reordered,
//! and each side stamps it with its own clock. Receivers must check the
//! `source` tag before acting on anything.

use serde::{Deserialize, Serialize};

/// Source tag stamped on messages sent by the dashboard.
pub const DASHBOARD_SOURCE: &str = "vmlab-dashboard";

/// Source tag stamped on messages sent by a console view.
pub const CONSOLE_SOURCE: &str = "vmlab-console";

/// Kind of a context message, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// User interacted with the sending context.
    Activity,
    /// Console gained input focus.
    Focus,
    /// Console lost input focus.
    Blur,
    /// Dashboard probing a console it opened.
    Handshake,
    /// Console answering a handshake.
    HandshakeAck,
    /// Dashboard ended the session; the console should close.
    Terminate,
}

/// Why a session set was ended. Only affects user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    UserEnd,
    IdleTimeout,
}

impl EndReason {
    /// Message shown to the user once the session is gone.
    pub fn user_message(self) -> &'static str {
        match self {
            EndReason::UserEnd => "Your session has ended.",
            EndReason::IdleTimeout => "Your session ended due to inactivity.",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::UserEnd => write!(f, "user-end"),
            EndReason::IdleTimeout => write!(f, "idle-timeout"),
        }
    }
}

/// One message on the dashboard/console link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub session_id: String,
    /// Sender clock, Unix ms.
    pub timestamp: i64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
}

impl ContextMessage {
    pub fn new(
        kind: MessageKind,
        session_id: impl Into<String>,
        timestamp: i64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            timestamp,
            source: source.into(),
            reason: None,
        }
    }

    /// Message originating from the dashboard.
    pub fn from_dashboard(kind: MessageKind, session_id: impl Into<String>, timestamp: i64) -> Self {
        Self::new(kind, session_id, timestamp, DASHBOARD_SOURCE)
    }

    /// Message originating from a console view.
    pub fn from_console(kind: MessageKind, session_id: impl Into<String>, timestamp: i64) -> Self {
        Self::new(kind, session_id, timestamp, CONSOLE_SOURCE)
    }

    /// Termination directive for a console.
    pub fn terminate(session_id: impl Into<String>, timestamp: i64, reason: EndReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::from_dashboard(MessageKind::Terminate, session_id, timestamp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = ContextMessage::from_console(MessageKind::HandshakeAck, "ses_1", 1_738_764_000_000);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"handshake-ack\""));
        assert!(json.contains("\"sessionId\":\"ses_1\""));
        assert!(json.contains("\"timestamp\":1738764000000"));
        assert!(json.contains("\"source\":\"vmlab-console\""));
        assert!(!json.contains("reason"));
    }

    #[test]
    fn test_terminate_carries_reason() {
        let msg = ContextMessage::terminate("ses_1", 0, EndReason::IdleTimeout);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "terminate");
        assert_eq!(json["reason"], "idle-timeout");
        assert_eq!(json["source"], DASHBOARD_SOURCE);
    }

    #[test]
    fn test_parse_foreign_message() {
        let raw = r#"{"type":"focus","sessionId":"abc","timestamp":5,"source":"elsewhere"}"#;
        let msg: ContextMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, MessageKind::Focus);
        assert_eq!(msg.source, "elsewhere");
        assert!(msg.reason.is_none());
    }

    #[test]
    fn test_idle_timeout_message() {
        assert!(EndReason::IdleTimeout.user_message().contains("ended due to inactivity"));
    }
}
