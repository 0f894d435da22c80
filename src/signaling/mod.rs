//! Signaling Module - TCP Control-Channel im LAN
//!
//! Dieses Modul verwaltet die Kommunikation mit dem anderen Gerät:
//! - Envelopes kodieren und dekodieren (JSON, Length-Prefix-Framing)
//! - Ausgehende Nachrichten senden (eine Verbindung pro Nachricht)
//! - Eingehende Verbindungen annehmen und an die Call Engine weiterleiten
//! - Pairing-Token (`lancall://ip:port`) parsen
//!

mod client;
mod framing;
mod messages;
mod server;
mod token;

pub use client::{with_retry, SignalingClient, SignalingError};
pub use framing::{read_envelope, write_envelope, MAX_FRAME_LEN};
pub use messages::*;
pub use server::{InboundHandler, SignalingServer, BUSY_ERROR_CODE};
pub use token::{parse_ipv4, PairingToken, TokenError, TOKEN_SCHEME};
