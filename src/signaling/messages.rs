//! Message Types für das Signaling-Protokoll
//!
//! Jede TCP-Verbindung transportiert genau einen `Envelope`:
//!
//! ```text
//! { "type": "CallRequest", "fromIp": "192.168.1.4", "timestamp": 1700000000000, "data": {...} }
//! ```
//!
//! Typ und Payload sind in Rust ein einziges Enum, damit ein Envelope nie
//! einen Payload tragen kann, der nicht zu seinem Typ passt.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid payload for {msg_type}: {reason}")]
    InvalidPayload {
        msg_type: MessageType,
        reason: String,
    },

    #[error("Frame exceeds the 64 KiB limit")]
    FrameTooLarge,
}

// ============================================================================
// MESSAGE TYPE
// ============================================================================

/// Alle Nachrichtentypen des Control-Channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    CallRequest,
    CallAccept,
    CallDecline,
    CallEnd,
    TextMessage,
    ConnectionRequest,
    ConnectionAck,
    KeepAlive,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::CallRequest,
        MessageType::CallAccept,
        MessageType::CallDecline,
        MessageType::CallEnd,
        MessageType::TextMessage,
        MessageType::ConnectionRequest,
        MessageType::ConnectionAck,
        MessageType::KeepAlive,
        MessageType::Error,
    ];

    /// Name auf dem Wire
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::CallRequest => "CallRequest",
            MessageType::CallAccept => "CallAccept",
            MessageType::CallDecline => "CallDecline",
            MessageType::CallEnd => "CallEnd",
            MessageType::TextMessage => "TextMessage",
            MessageType::ConnectionRequest => "ConnectionRequest",
            MessageType::ConnectionAck => "ConnectionAck",
            MessageType::KeepAlive => "KeepAlive",
            MessageType::Error => "Error",
        }
    }

    /// Name, den ältere Clients senden
    fn legacy_name(self) -> &'static str {
        match self {
            MessageType::CallRequest => "CALL_REQUEST",
            MessageType::CallAccept => "CALL_ACCEPT",
            MessageType::CallDecline => "CALL_DECLINE",
            MessageType::CallEnd => "CALL_END",
            MessageType::TextMessage => "TEXT_MESSAGE",
            MessageType::ConnectionRequest => "CONNECTION_REQUEST",
            MessageType::ConnectionAck => "CONNECTION_ACK",
            MessageType::KeepAlive => "KEEP_ALIVE",
            MessageType::Error => "ERROR",
        }
    }

    /// Akzeptiert den aktuellen und den Legacy-Namen
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == name || t.legacy_name() == name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Daten eines Anruf-Requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallRequestData {
    pub caller_name: String,
    pub caller_ip: String,
    /// Nur informativ, der Audio-Port ist prozessweit fest
    pub audio_port: u16,
}

/// Daten einer Anruf-Annahme
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallAcceptData {
    pub receiver_ip: String,
    pub audio_port: u16,
}

/// Textnachricht
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextMessageData {
    pub message: String,
    pub timestamp: i64,
}

/// Verbindungsanfrage nach dem Scannen eines Pairing-Tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionRequestData {
    pub requester_id: String,
    pub timestamp: i64,
}

/// Fehlermeldung an den Peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorData {
    pub error_code: String,
    pub error_message: String,
}

/// Typ-abhängiger Inhalt eines Envelopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    CallRequest(CallRequestData),
    CallAccept(CallAcceptData),
    CallDecline,
    CallEnd,
    TextMessage(TextMessageData),
    ConnectionRequest(ConnectionRequestData),
    ConnectionAck,
    KeepAlive,
    Error(ErrorData),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::CallRequest(_) => MessageType::CallRequest,
            Payload::CallAccept(_) => MessageType::CallAccept,
            Payload::CallDecline => MessageType::CallDecline,
            Payload::CallEnd => MessageType::CallEnd,
            Payload::TextMessage(_) => MessageType::TextMessage,
            Payload::ConnectionRequest(_) => MessageType::ConnectionRequest,
            Payload::ConnectionAck => MessageType::ConnectionAck,
            Payload::KeepAlive => MessageType::KeepAlive,
            Payload::Error(_) => MessageType::Error,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Payload::CallRequest(d) => json!({
                "callerName": d.caller_name,
                "callerIp": d.caller_ip,
                "audioPort": d.audio_port,
            }),
            Payload::CallAccept(d) => json!({
                "receiverIp": d.receiver_ip,
                "audioPort": d.audio_port,
            }),
            Payload::TextMessage(d) => json!({
                "message": d.message,
                "timestamp": d.timestamp,
            }),
            Payload::ConnectionRequest(d) => json!({
                "requesterId": d.requester_id,
                "timestamp": d.timestamp,
            }),
            Payload::Error(d) => json!({
                "errorCode": d.error_code,
                "errorMessage": d.error_message,
            }),
            Payload::CallDecline | Payload::CallEnd | Payload::ConnectionAck | Payload::KeepAlive => {
                Value::Null
            }
        }
    }

    fn from_value(msg_type: MessageType, data: Value) -> Result<Self, ProtocolError> {
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            msg_type,
            reason: e.to_string(),
        };

        let payload = match msg_type {
            MessageType::CallRequest => {
                Payload::CallRequest(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageType::CallAccept => {
                Payload::CallAccept(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageType::TextMessage => {
                Payload::TextMessage(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageType::ConnectionRequest => {
                Payload::ConnectionRequest(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageType::Error => Payload::Error(serde_json::from_value(data).map_err(invalid)?),
            // Datenlose Typen ignorieren einen eventuell mitgeschickten Inhalt
            MessageType::CallDecline => Payload::CallDecline,
            MessageType::CallEnd => Payload::CallEnd,
            MessageType::ConnectionAck => Payload::ConnectionAck,
            MessageType::KeepAlive => Payload::KeepAlive,
        };

        Ok(payload)
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Wire-Repräsentation, nur für (De)Serialisierung
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(rename = "fromIp", default)]
    from_ip: Option<String>,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    data: Value,
}

/// Eine vollständige Protokoll-Nachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from_ip: String,
    /// Millisekunden seit Epoch
    pub timestamp: i64,
    pub payload: Payload,
}

impl Envelope {
    /// Erstellt einen Envelope mit aktuellem Timestamp
    pub fn new(from_ip: impl Into<String>, payload: Payload) -> Self {
        Self {
            from_ip: from_ip.into(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn call_request(from_ip: &str, caller_name: &str, audio_port: u16) -> Self {
        Self::new(
            from_ip,
            Payload::CallRequest(CallRequestData {
                caller_name: caller_name.to_string(),
                caller_ip: from_ip.to_string(),
                audio_port,
            }),
        )
    }

    pub fn call_accept(from_ip: &str, audio_port: u16) -> Self {
        Self::new(
            from_ip,
            Payload::CallAccept(CallAcceptData {
                receiver_ip: from_ip.to_string(),
                audio_port,
            }),
        )
    }

    pub fn call_decline(from_ip: &str) -> Self {
        Self::new(from_ip, Payload::CallDecline)
    }

    pub fn call_end(from_ip: &str) -> Self {
        Self::new(from_ip, Payload::CallEnd)
    }

    pub fn text_message(from_ip: &str, message: &str) -> Self {
        Self::new(
            from_ip,
            Payload::TextMessage(TextMessageData {
                message: message.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            }),
        )
    }

    pub fn connection_request(from_ip: &str) -> Self {
        Self::new(
            from_ip,
            Payload::ConnectionRequest(ConnectionRequestData {
                requester_id: from_ip.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            }),
        )
    }

    pub fn connection_ack(from_ip: &str) -> Self {
        Self::new(from_ip, Payload::ConnectionAck)
    }

    pub fn keep_alive(from_ip: &str) -> Self {
        Self::new(from_ip, Payload::KeepAlive)
    }

    pub fn error(from_ip: &str, code: &str, message: &str) -> Self {
        Self::new(
            from_ip,
            Payload::Error(ErrorData {
                error_code: code.to_string(),
                error_message: message.to_string(),
            }),
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Serialisiert den Envelope als JSON
    pub fn encode(&self) -> Vec<u8> {
        let value = json!({
            "type": self.message_type().as_str(),
            "fromIp": self.from_ip,
            "timestamp": self.timestamp,
            "data": self.payload.to_value(),
        });
        value.to_string().into_bytes()
    }

    /// Parst einen Envelope; unbekannte Typen sind ein Fehler
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        let msg_type = MessageType::parse(&raw.msg_type)
            .ok_or_else(|| ProtocolError::UnknownType(raw.msg_type.clone()))?;

        Ok(Self {
            from_ip: raw.from_ip.unwrap_or_default(),
            timestamp: raw.timestamp,
            payload: Payload::from_value(msg_type, raw.data)?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
