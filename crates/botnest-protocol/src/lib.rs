//! Connector protocol types for communication between botnest and a
//! messaging-protocol client.
//!
//! The runtime never speaks the wire protocol itself. A connector owns the
//! socket and exchanges typed values with the runtime:
//!
//! - **Commands** (runtime → connector): outbound sends and shutdown.
//! - **Events** (connector → runtime): lifecycle transitions, pairing
//!   artifacts, and inbound messages.
//!
//! Close codes observed on the wire are mapped to [`DisconnectReason`] here
//! so every session supervisor classifies disconnects the same way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (runtime → connector)
// ============================================================================

/// Commands sent from the runtime to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorCommand {
    /// First command on a fresh connection: connect options plus any
    /// stored credential material for resuming an authenticated session.
    Initialize {
        options: ConnectOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<serde_json::Value>,
    },

    /// Send a text message to a chat.
    SendMessage {
        chat_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// Close the connection and release the socket.
    Shutdown,
}

// ============================================================================
// Events (connector → runtime)
// ============================================================================

/// Events sent from a connector to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorEvent {
    /// Connection established and authenticated.
    Open {
        /// Account identifier the platform assigned to this session, once
        /// known. Stable across reconnects.
        account_id: String,
    },

    /// Connection closed. `code` is the platform close code, when present.
    Closed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Authentication artifact for an unauthenticated session.
    Pairing(PairingArtifact),

    /// Inbound message from a user.
    MessageReceived(Box<InboundMessage>),

    /// The platform rotated this session's credentials. The runtime must
    /// persist the new bundle before the next reconnect.
    CredentialsRotated {
        /// Opaque serialized credential material.
        bundle: serde_json::Value,
    },
}

/// How a new session should authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingMethod {
    /// Scan a QR payload.
    Qr,
    /// Enter a short numeric code on the device.
    NumericCode,
}

/// A time-boxed authentication artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairingArtifact {
    Qr {
        /// Raw QR payload for rendering.
        payload: String,
        /// Seconds until the payload stops being accepted.
        expires_in: u32,
    },
    NumericCode {
        code: String,
        expires_in: u32,
    },
}

impl PairingArtifact {
    pub fn expires_in(&self) -> u32 {
        match self {
            PairingArtifact::Qr { expires_in, .. } => *expires_in,
            PairingArtifact::NumericCode { expires_in, .. } => *expires_in,
        }
    }
}

/// Options handed to a connector when opening a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Browser identity string presented to the platform.
    pub browser_label: String,
    pub pairing_method: PairingMethod,
}

// ============================================================================
// Inbound messages
// ============================================================================

/// An inbound message, normalized by the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub chat_id: String,
    pub sender: Sender,
    pub content: MessageContent,
    /// Whether `chat_id` is a group chat.
    pub is_group: bool,
    /// Whether the sender holds admin rights in the chat. Only meaningful
    /// for group chats.
    #[serde(default)]
    pub sender_is_admin: bool,
    /// Whether the session's own account holds admin rights in the chat.
    #[serde(default)]
    pub bot_is_admin: bool,
    /// Message sent by the session's own account (echoed back by the
    /// platform).
    #[serde(default)]
    pub from_self: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Sender identity for inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Content of an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Text { text: String },

    /// Protocol-internal stub (receipts, key rotations, history sync).
    /// Carries no user content and never enters dispatch.
    ProtocolInternal,

    /// Anything else the connector could not classify.
    Unknown {
        #[serde(default)]
        raw: serde_json::Value,
    },
}

impl MessageContent {
    /// Extract text content if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ============================================================================
// Disconnect classification
// ============================================================================

/// Why a connection closed, classified from the platform close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Account logged out server-side. Terminal until re-paired.
    LoggedOut,
    /// Stored credentials rejected at handshake. The session must delete
    /// them and pair again.
    CredentialsRejected,
    /// Handshake or keep-alive timed out.
    TimedOut,
    /// Server closed the connection without a terminal condition.
    ConnectionClosed,
    /// Another device took over this session.
    SessionReplaced,
    /// Server-side session state is unrecoverable.
    BadSession,
    /// Server asked for a fresh socket after a protocol upgrade.
    RestartRequired,
    /// Transport dropped with no close code.
    ConnectionLost,
    /// Close code outside the classification table.
    Unknown,
}

impl DisconnectReason {
    /// Map a platform close code to a reason. `None` means the transport
    /// dropped without a close frame.
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => DisconnectReason::LoggedOut,
            Some(405) => DisconnectReason::CredentialsRejected,
            Some(408) => DisconnectReason::TimedOut,
            Some(428) => DisconnectReason::ConnectionClosed,
            Some(440) => DisconnectReason::SessionReplaced,
            Some(500) => DisconnectReason::BadSession,
            Some(515) => DisconnectReason::RestartRequired,
            None => DisconnectReason::ConnectionLost,
            Some(_) => DisconnectReason::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = ConnectorCommand::SendMessage {
            chat_id: "123".to_string(),
            text: "Hello!".to_string(),
            reply_to: None,
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"send_message""#));

        let parsed: ConnectorCommand = serde_json::from_str(&json).unwrap();
        match parsed {
            ConnectorCommand::SendMessage { text, .. } => {
                assert_eq!(text, "Hello!");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ConnectorEvent::Pairing(PairingArtifact::NumericCode {
            code: "12345678".to_string(),
            expires_in: 45,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"pairing""#));
        assert!(json.contains(r#""kind":"numeric_code""#));

        let parsed: ConnectorEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ConnectorEvent::Pairing(artifact) => {
                assert_eq!(artifact.expires_in(), 45);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_close_code_classification() {
        let table = [
            (Some(401), DisconnectReason::LoggedOut),
            (Some(405), DisconnectReason::CredentialsRejected),
            (Some(408), DisconnectReason::TimedOut),
            (Some(428), DisconnectReason::ConnectionClosed),
            (Some(440), DisconnectReason::SessionReplaced),
            (Some(500), DisconnectReason::BadSession),
            (Some(515), DisconnectReason::RestartRequired),
            (None, DisconnectReason::ConnectionLost),
            (Some(999), DisconnectReason::Unknown),
        ];
        for (code, expected) in table {
            assert_eq!(DisconnectReason::from_close_code(code), expected);
        }
    }

    #[test]
    fn test_message_content_as_text() {
        let text = MessageContent::Text {
            text: "hello".to_string(),
        };
        assert_eq!(text.as_text(), Some("hello"));

        assert_eq!(MessageContent::ProtocolInternal.as_text(), None);
    }
}
