//! TCP Client für ausgehende Signaling-Nachrichten
//!
//! Jede Operation öffnet eine eigene Verbindung, schreibt genau einen
//! Envelope und schließt sie wieder:
//! - `CallRequest` (fire-and-forget)
//! - `TextMessage` mit Retry
//! - `ConnectionRequest` mit synchronem Warten auf `ConnectionAck`
//! - `CallDecline` / `CallEnd` (best effort)

use super::framing::{read_envelope, write_envelope};
use super::messages::*;
use crate::config::{LanCallConfig, RetryPolicy};
use crate::network::LocalAddress;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("No response within {0:?}")]
    ReadTimeout(Duration),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(MessageType),
}

// ============================================================================
// RETRY
// ============================================================================

/// Führt `op` bis zu `policy.max_attempts` mal aus, mit fester Pause dazwischen
///
/// Gibt die Nummer des erfolgreichen Versuchs oder den letzten Fehler zurück.
pub async fn with_retry<F, Fut, E>(policy: RetryPolicy, mut op: F) -> Result<u32, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt < attempts => {
                tracing::warn!("Attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("Attempt {}/{} failed, giving up: {}", attempt, attempts, e);
                return Err(e);
            }
        }
    }
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Sendet Envelopes an den Control-Port eines Peers
pub struct SignalingClient {
    config: Arc<LanCallConfig>,
    local_address: Arc<dyn LocalAddress>,
}

impl SignalingClient {
    pub fn new(config: Arc<LanCallConfig>, local_address: Arc<dyn LocalAddress>) -> Self {
        Self {
            config,
            local_address,
        }
    }

    /// Eigene IPv4 für `fromIp` (leer, falls unbekannt)
    pub fn local_ip(&self) -> String {
        self.local_address.local_ipv4().unwrap_or_else(|| {
            tracing::warn!("Local IPv4 unknown, sending empty fromIp");
            String::new()
        })
    }

    /// Sendet einen `CallRequest` ohne auf Antwort zu warten
    pub async fn send_call_request(&self, target: SocketAddr) -> Result<(), SignalingError> {
        let envelope = Envelope::call_request(
            &self.local_ip(),
            &self.config.caller_name,
            self.config.audio_port,
        );

        tracing::info!("Sending call request to {}", target);
        let mut stream = connect(target, self.config.call_connect_timeout).await?;
        write_envelope(&mut stream, &envelope).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Sendet eine Textnachricht mit Retry-Policy
    ///
    /// Gibt die Nummer des erfolgreichen Versuchs zurück.
    pub async fn send_text(&self, target: SocketAddr, text: &str) -> Result<u32, SignalingError> {
        with_retry(self.config.message_retry, |attempt| {
            tracing::debug!("Sending text message to {} (attempt {})", target, attempt);
            self.send_text_once(target, text)
        })
        .await
    }

    /// Ein einzelner Sendeversuch
    pub async fn send_text_once(&self, target: SocketAddr, text: &str) -> Result<(), SignalingError> {
        let envelope = Envelope::text_message(&self.local_ip(), text);
        let io_timeout = self.config.message_io_timeout;

        let mut stream = connect(target, self.config.message_connect_timeout).await?;
        timeout(io_timeout, write_envelope(&mut stream, &envelope))
            .await
            .map_err(|_| SignalingError::WriteTimeout(io_timeout))??;

        // Write-Seite schließen, damit der Peer EOF sieht
        stream.shutdown().await?;
        Ok(())
    }

    /// Sendet einen `ConnectionRequest` und wartet auf das `ConnectionAck`
    pub async fn request_connection(&self, target: SocketAddr) -> Result<Envelope, SignalingError> {
        let envelope = Envelope::connection_request(&self.local_ip());
        let ack_timeout = self.config.ack_timeout;

        tracing::info!("Sending connection request to {}", target);
        let mut stream = connect(target, self.config.call_connect_timeout).await?;
        write_envelope(&mut stream, &envelope).await?;

        let response = timeout(ack_timeout, read_envelope(&mut stream))
            .await
            .map_err(|_| SignalingError::ReadTimeout(ack_timeout))??;

        match response.payload {
            Payload::ConnectionAck => {
                tracing::info!("Connection acknowledged by {}", target);
                Ok(response)
            }
            _ => Err(SignalingError::UnexpectedResponse(response.message_type())),
        }
    }

    /// Best-effort Benachrichtigung (`CallDecline`, `CallEnd`)
    pub async fn notify(&self, target: SocketAddr, payload: Payload) -> Result<(), SignalingError> {
        let envelope = Envelope::new(self.local_ip(), payload);
        let mut stream = connect(target, self.config.message_connect_timeout).await?;
        write_envelope(&mut stream, &envelope).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("caller_name", &self.config.caller_name)
            .field("audio_port", &self.config.audio_port)
            .finish()
    }
}

async fn connect(target: SocketAddr, connect_timeout: Duration) -> Result<TcpStream, SignalingError> {
    let stream = timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| SignalingError::ConnectTimeout(connect_timeout))??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

// ============================================================================
// TESTS
// ============================================================================
