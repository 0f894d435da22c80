//! TCP Server für eingehende Signaling-Nachrichten
//!
//! Der Accept-Loop läuft für die gesamte Prozess-Lebensdauer. Jede
//! Verbindung bekommt einen eigenen Task: ein Envelope rein, höchstens
//! einer raus, dann wird geschlossen. Fehler einer Verbindung beenden nie
//! den Accept-Loop.

use super::client::SignalingError;
use super::framing::{read_envelope, write_envelope};
use super::messages::*;
use crate::call_engine::CallEngine;
use crate::database::MessageHistory;
use crate::events::CallEvent;
use crate::network::LocalAddress;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Fehlercode im `Error`-Envelope, wenn bereits telefoniert wird
pub const BUSY_ERROR_CODE: &str = "BUSY";

// ============================================================================
// INBOUND HANDLER
// ============================================================================

/// Verarbeitet genau einen eingehenden Envelope
pub struct InboundHandler {
    engine: Arc<CallEngine>,
    local_address: Arc<dyn LocalAddress>,
    history: Option<Arc<MessageHistory>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl InboundHandler {
    pub fn new(
        engine: Arc<CallEngine>,
        local_address: Arc<dyn LocalAddress>,
        history: Option<Arc<MessageHistory>>,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            engine,
            local_address,
            history,
            event_tx,
        }
    }

    /// Dispatcht nach Typ; gibt die Antwort zurück, falls eine fällig ist
    ///
    /// `peer_ip` ist die Adresse der TCP-Gegenstelle, nicht `fromIp` aus dem
    /// Envelope.
    pub async fn handle_envelope(&self, peer_ip: &str, envelope: Envelope) -> Option<Envelope> {
        tracing::debug!(
            "Received {} from {} (fromIp: {:?})",
            envelope.message_type(),
            peer_ip,
            envelope.from_ip
        );

        match envelope.payload {
            Payload::CallRequest(data) => {
                tracing::info!(
                    "Call request from {} ({}, audio port {})",
                    peer_ip,
                    data.caller_name,
                    data.audio_port
                );
                match self.engine.register_incoming_call(peer_ip).await {
                    Ok(()) => None,
                    Err(e) => Some(Envelope::error(
                        &self.local_ip(),
                        BUSY_ERROR_CODE,
                        &e.to_string(),
                    )),
                }
            }
            Payload::TextMessage(data) => {
                tracing::info!("Text message from {}", peer_ip);
                if let Some(history) = &self.history {
                    if let Err(e) = history.record_received(peer_ip, &data.message) {
                        tracing::error!("Failed to store message: {}", e);
                    }
                }
                let _ = self.event_tx.send(CallEvent::TextMessageReceived {
                    from: peer_ip.to_string(),
                    text: data.message,
                });
                None
            }
            Payload::ConnectionRequest(data) => {
                tracing::info!(
                    "Connection request from {} (requester {})",
                    peer_ip,
                    data.requester_id
                );
                // Ohne laufenden Anruf wird der Peer zum Messaging-Ziel
                self.engine.adopt_messaging_peer(peer_ip).await;
                let _ = self.event_tx.send(CallEvent::ConnectionEstablished {
                    from: peer_ip.to_string(),
                });
                let _ = self.event_tx.send(CallEvent::ConnectionStatusChanged(format!(
                    "Connected to {}",
                    peer_ip
                )));
                Some(Envelope::connection_ack(&self.local_ip()))
            }
            Payload::CallEnd => {
                self.engine.remote_ended(peer_ip).await;
                None
            }
            Payload::CallDecline => {
                self.engine.remote_declined(peer_ip).await;
                None
            }
            Payload::Error(data) => {
                tracing::warn!(
                    "Error from {}: {} ({})",
                    peer_ip,
                    data.error_message,
                    data.error_code
                );
                None
            }
            other => {
                tracing::debug!("Ignoring {} from {}", other.message_type(), peer_ip);
                None
            }
        }
    }

    fn local_ip(&self) -> String {
        self.local_address.local_ipv4().unwrap_or_default()
    }
}

// ============================================================================
// SIGNALING SERVER
// ============================================================================

pub struct SignalingServer {
    listener: TcpListener,
    handler: Arc<InboundHandler>,
    read_timeout: Duration,
}

impl SignalingServer {
    /// Bindet den Control-Port
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<InboundHandler>,
        read_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Signaling server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            handler,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept-Loop; kehrt nur zurück, wenn der Task abgebrochen wird
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&self.handler);
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(handler, stream, peer, read_timeout).await
                        {
                            tracing::warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    // Kurz warten, z.B. bei erschöpften File-Deskriptoren
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    handler: Arc<InboundHandler>,
    mut stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
) -> Result<(), SignalingError> {
    let envelope = timeout(read_timeout, read_envelope(&mut stream))
        .await
        .map_err(|_| SignalingError::ReadTimeout(read_timeout))??;

    let peer_ip = peer_ip_string(&peer);
    if let Some(reply) = handler.handle_envelope(&peer_ip, envelope).await {
        write_envelope(&mut stream, &reply).await?;
    }
    let _ = stream.shutdown().await;
    Ok(())
}

/// IPv4-gemappte IPv6-Adressen als IPv4 ausgeben
fn peer_ip_string(peer: &SocketAddr) -> String {
    match peer {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.ip().to_string(),
        },
        SocketAddr::V4(v4) => v4.ip().to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::fake::FakeAudioBackend;
    use crate::call_engine::CallState;
    use crate::config::LanCallConfig;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use crate::network::StaticLocalAddress;

    struct Fixture {
        handler: Arc<InboundHandler>,
        engine: Arc<CallEngine>,
        history: Arc<MessageHistory>,
        events: broadcast::Receiver<CallEvent>,
    }

    fn fixture() -> Fixture {
        let config = LanCallConfig {
            audio_port: 0,
            ..LanCallConfig::default()
        };
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Arc::new(CallEngine::new(
            Arc::new(FakeAudioBackend::silent()),
            &config,
            tx.clone(),
        ));
        let history = Arc::new(MessageHistory::open_in_memory().unwrap());
        let handler = Arc::new(InboundHandler::new(
            Arc::clone(&engine),
            Arc::new(StaticLocalAddress("10.0.0.1".into())),
            Some(Arc::clone(&history)),
            tx,
        ));
        Fixture {
            handler,
            engine,
            history,
            events: rx,
        }
    }

    fn next_non_state(rx: &mut broadcast::Receiver<CallEvent>) -> Option<CallEvent> {
        while let Ok(event) = rx.try_recv() {
            if !matches!(
                event,
                CallEvent::StateChanged(_) | CallEvent::ConnectionStatusChanged(_)
            ) {
                return Some(event);
            }
        }
        None
    }

    #[tokio::test]
    async fn test_call_request_registers_incoming() {
        let mut f = fixture();

        let reply = f
            .handler
            .handle_envelope("10.0.0.5", Envelope::call_request("10.0.0.5", "Bob", 10002))
            .await;

        assert!(reply.is_none());
        assert_eq!(f.engine.state(), CallState::Incoming);
        assert_eq!(f.engine.remote_address().as_deref(), Some("10.0.0.5"));
        assert!(!f.engine.relay_running());
        assert_eq!(
            next_non_state(&mut f.events),
            Some(CallEvent::IncomingCall {
                from: "10.0.0.5".into()
            })
        );
        assert_eq!(next_non_state(&mut f.events), None);
    }

    #[tokio::test]
    async fn test_busy_reply_for_second_caller() {
        let f = fixture();
        f.handler
            .handle_envelope("10.0.0.5", Envelope::call_request("10.0.0.5", "Bob", 10002))
            .await;

        let reply = f
            .handler
            .handle_envelope("10.0.0.6", Envelope::call_request("10.0.0.6", "Eve", 10002))
            .await
            .unwrap();

        match reply.payload {
            Payload::Error(data) => assert_eq!(data.error_code, BUSY_ERROR_CODE),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(f.engine.remote_address().as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_text_message_is_emitted_and_stored() {
        let mut f = fixture();

        let reply = f
            .handler
            .handle_envelope("10.0.0.5", Envelope::text_message("10.0.0.5", "hallo"))
            .await;

        assert!(reply.is_none());
        assert_eq!(
            next_non_state(&mut f.events),
            Some(CallEvent::TextMessageReceived {
                from: "10.0.0.5".into(),
                text: "hallo".into()
            })
        );
        assert_eq!(f.history.conversation("10.0.0.5").unwrap()[0].text, "hallo");
    }

    #[tokio::test]
    async fn test_connection_request_is_acknowledged() {
        let mut f = fixture();

        let reply = f
            .handler
            .handle_envelope("10.0.0.5", Envelope::connection_request("10.0.0.5"))
            .await
            .unwrap();

        assert_eq!(reply.message_type(), MessageType::ConnectionAck);
        assert_eq!(reply.from_ip, "10.0.0.1");
        assert_eq!(
            next_non_state(&mut f.events),
            Some(CallEvent::ConnectionEstablished {
                from: "10.0.0.5".into()
            })
        );
        assert_eq!(f.engine.remote_address().as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_connection_request_during_call() {
        let mut f = fixture();
        f.engine.register_incoming_call("10.0.0.5").await.unwrap();
        while f.events.try_recv().is_ok() {}

        let reply = f
            .handler
            .handle_envelope("10.0.0.6", Envelope::connection_request("10.0.0.6"))
            .await
            .unwrap();

        assert_eq!(reply.message_type(), MessageType::ConnectionAck);
        assert_eq!(
            next_non_state(&mut f.events),
            Some(CallEvent::ConnectionEstablished {
                from: "10.0.0.6".into()
            })
        );
        assert_eq!(next_non_state(&mut f.events), None);
        assert_eq!(f.engine.state(), CallState::Incoming);
        assert_eq!(f.engine.remote_address().as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_keep_alive_is_dropped() {
        let mut f = fixture();

        let reply = f
            .handler
            .handle_envelope("10.0.0.5", Envelope::keep_alive("10.0.0.5"))
            .await;

        assert!(reply.is_none());
        assert_eq!(f.engine.state(), CallState::Idle);
        assert_eq!(next_non_state(&mut f.events), None);
    }

    #[tokio::test]
    async fn test_server_survives_garbage_and_answers_next() {
        let f = fixture();
        let server = SignalingServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&f.handler),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        // Kaputter Frame
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0, 0, 0, 4, b'n', b'o', b'p', b'e'])
            .await
            .unwrap();
        drop(bad);

        // Verbindung ohne Daten läuft in den Read-Timeout
        let _silent = TcpStream::connect(addr).await.unwrap();

        let mut good = TcpStream::connect(addr).await.unwrap();
        write_envelope(&mut good, &Envelope::connection_request("127.0.0.1"))
            .await
            .unwrap();
        let ack = timeout(Duration::from_secs(1), read_envelope(&mut good))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type(), MessageType::ConnectionAck);

        task.abort();
    }

    #[test]
    fn test_mapped_ipv6_peer() {
        let peer: SocketAddr = "[::ffff:192.168.1.4]:5000".parse().unwrap();
        assert_eq!(peer_ip_string(&peer), "192.168.1.4");
    }
}
