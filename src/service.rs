//! Call Service - die Fassade für UI-Kollaboratoren
//!
//! Ein `CallService` pro Prozess, geteilt über `Arc`. Alle Befehle kehren
//! sofort zurück; Netzwerk-Operationen laufen als eigene Tasks und melden
//! ihr Ergebnis über `CallEvent`s. Die zurückgegebenen `JoinHandle`s kann
//! der Aufrufer abwarten, muss es aber nicht.

use crate::call_engine::{AudioBackend, CallEngine, CallEngineError, CallSession, CallState};
use crate::config::LanCallConfig;
use crate::database::{DatabaseError, MessageHistory, StoredMessage};
use crate::events::{spawn_dispatcher, CallEvent, CallEventSink, SinkSlot, EVENT_CHANNEL_CAPACITY};
use crate::network::LocalAddress;
use crate::signaling::{
    parse_ipv4, InboundHandler, PairingToken, Payload, SignalingClient, SignalingError,
    SignalingServer, TokenError,
};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] TokenError),

    #[error("Call error: {0}")]
    Call(#[from] CallEngineError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to bind control port: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Service already started")]
    AlreadyStarted,

    #[error("No remote address set")]
    NoRemote,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message history is disabled")]
    HistoryDisabled,
}

/// Zuletzt bekannter Control-Port eines Peers
type KnownPeer = Arc<Mutex<Option<(String, u16)>>>;

// ============================================================================
// CALL SERVICE
// ============================================================================

pub struct CallService {
    config: Arc<LanCallConfig>,
    engine: Arc<CallEngine>,
    client: Arc<SignalingClient>,
    local_address: Arc<dyn LocalAddress>,
    history: Option<Arc<MessageHistory>>,
    event_tx: broadcast::Sender<CallEvent>,
    sink: SinkSlot,
    known_peer: KnownPeer,
    listen_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallService {
    /// Erstellt den Service; öffnet den Verlauf, falls konfiguriert
    pub fn new(
        config: LanCallConfig,
        audio: Arc<dyn AudioBackend>,
        local_address: Arc<dyn LocalAddress>,
    ) -> Result<Arc<Self>, ServiceError> {
        let history = match &config.history_path {
            Some(path) => Some(MessageHistory::open(path)?),
            None => None,
        };
        Ok(Self::with_history(config, audio, local_address, history))
    }

    pub fn with_history(
        config: LanCallConfig,
        audio: Arc<dyn AudioBackend>,
        local_address: Arc<dyn LocalAddress>,
        history: Option<MessageHistory>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Arc::new(CallEngine::new(audio, &config, event_tx.clone()));
        let client = Arc::new(SignalingClient::new(
            Arc::clone(&config),
            Arc::clone(&local_address),
        ));

        Arc::new(Self {
            config,
            engine,
            client,
            local_address,
            history: history.map(Arc::new),
            event_tx,
            sink: Arc::new(RwLock::new(None)),
            known_peer: Arc::new(Mutex::new(None)),
            listen_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bindet den Control-Port und startet Accept-Loop und Event-Dispatcher
    pub async fn start(&self) -> Result<SocketAddr, ServiceError> {
        if self.listen_addr.lock().is_some() {
            return Err(ServiceError::AlreadyStarted);
        }

        let handler = Arc::new(InboundHandler::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.local_address),
            self.history.clone(),
            self.event_tx.clone(),
        ));
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.control_port);
        let server = SignalingServer::bind(bind, handler, self.config.inbound_read_timeout)
            .await
            .map_err(ServiceError::Bind)?;
        let addr = server.local_addr().map_err(ServiceError::Bind)?;

        {
            let mut tasks = self.tasks.lock();
            tasks.push(spawn_dispatcher(
                self.event_tx.subscribe(),
                Arc::clone(&self.sink),
            ));
            tasks.push(tokio::spawn(server.run()));
        }
        *self.listen_addr.lock() = Some(addr);

        tracing::info!("Call service started on port {}", addr.port());
        self.emit(CallEvent::ConnectionStatusChanged(format!(
            "Ready on port {}",
            addr.port()
        )));
        Ok(addr)
    }

    /// Stoppt Tasks und ein laufendes Relay
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.engine.shutdown().await;
        *self.listen_addr.lock() = None;
        tracing::info!("Call service stopped");
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Registriert den Sink; `None` hängt ihn ab
    pub fn set_event_sink(&self, sink: Option<Arc<dyn CallEventSink>>) {
        *self.sink.write() = sink;
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    /// Ruft `ip:port` an
    pub async fn place_call(&self, ip: &str, port: u16) -> Result<JoinHandle<()>, ServiceError> {
        let token = self.checked(PairingToken::from_parts(ip, port as u32))?;
        self.dial(token).await
    }

    /// Ruft den Peer aus einem Pairing-Token an
    pub async fn place_call_to(&self, token: &str) -> Result<JoinHandle<()>, ServiceError> {
        let token = self.checked(token.parse::<PairingToken>())?;
        self.dial(token).await
    }

    async fn dial(&self, token: PairingToken) -> Result<JoinHandle<()>, ServiceError> {
        let host = token.host();
        let call_id = self.engine.begin_outgoing(&host).await?;
        *self.known_peer.lock() = Some((host, token.port()));

        let engine = Arc::clone(&self.engine);
        let client = Arc::clone(&self.client);
        let settle_delay = self.config.call_settle_delay;

        Ok(tokio::spawn(async move {
            match client.send_call_request(token.socket_addr()).await {
                Ok(()) => {
                    // Der Peer bestätigt nicht; nach der Wartezeit gilt der Anruf als verbunden
                    tokio::time::sleep(settle_delay).await;
                    let _ = engine.complete_outgoing(call_id).await;
                }
                Err(e) => engine.fail_outgoing(call_id, describe_failure(&e)).await,
            }
        }))
    }

    pub async fn answer(&self) -> Result<(), ServiceError> {
        self.engine.answer().await?;
        Ok(())
    }

    /// Lehnt ab und informiert den Anrufer (best effort)
    pub async fn decline(&self) -> Result<(), ServiceError> {
        let remote = self.engine.decline().await?;
        self.notify_peer(&remote, Payload::CallDecline);
        Ok(())
    }

    /// Legt auf; ohne laufenden Anruf ein No-op
    pub async fn end(&self) {
        if let Some(remote) = self.engine.end_call().await {
            self.notify_peer(&remote, Payload::CallEnd);
        }
    }

    pub fn toggle_mute(&self) -> bool {
        self.engine.toggle_mute()
    }

    pub fn is_muted(&self) -> bool {
        self.engine.is_muted()
    }

    pub fn current_state(&self) -> CallState {
        self.engine.state()
    }

    pub fn remote_address(&self) -> Option<String> {
        self.engine.remote_address()
    }

    pub fn session(&self) -> CallSession {
        self.engine.session()
    }

    // ========================================================================
    // MESSAGING
    // ========================================================================

    /// Sendet Text an den aktuellen Peer (mit Retry)
    pub fn send_text(&self, text: &str) -> Result<JoinHandle<()>, ServiceError> {
        if text.trim().is_empty() {
            self.emit(CallEvent::MessageSendFailed("Message is empty".to_string()));
            return Err(ServiceError::EmptyMessage);
        }
        let Some(remote) = self.engine.remote_address() else {
            self.emit(CallEvent::MessageSendFailed(
                "No remote address set".to_string(),
            ));
            return Err(ServiceError::NoRemote);
        };
        let target = match control_addr(&self.known_peer, &remote, self.config.control_port) {
            Ok(target) => target,
            Err(e) => {
                self.emit(CallEvent::MessageSendFailed(format!("Invalid address: {}", e)));
                return Err(e.into());
            }
        };

        let stored = self.history.as_ref().and_then(|history| {
            history
                .record_sent(&self.client.local_ip(), &remote, text)
                .map_err(|e| tracing::error!("Failed to store message: {}", e))
                .ok()
        });

        let client = Arc::clone(&self.client);
        let history = self.history.clone();
        let event_tx = self.event_tx.clone();
        let max_attempts = self.config.message_retry.max_attempts;
        let text = text.to_string();

        Ok(tokio::spawn(async move {
            match client.send_text(target, &text).await {
                Ok(attempt) => {
                    tracing::info!("Message delivered to {} (attempt {})", remote, attempt);
                    if let (Some(history), Some(stored)) = (history, stored) {
                        if let Err(e) = history.mark_delivered(&stored.id) {
                            tracing::error!("Failed to update message: {}", e);
                        }
                    }
                    let _ = event_tx.send(CallEvent::MessageSent { to: remote });
                }
                Err(e) => {
                    let _ = event_tx.send(CallEvent::MessageSendFailed(format!(
                        "Failed to send message after {} attempts: {}",
                        max_attempts, e
                    )));
                }
            }
        }))
    }

    /// Setzt den Peer für Nachrichten, ohne anzurufen
    pub async fn set_remote_for_messaging_only(&self, ip: &str) -> Result<(), ServiceError> {
        let ip = self.checked(parse_ipv4(ip))?.to_string();
        self.engine.set_remote_for_messaging(&ip).await?;
        Ok(())
    }

    /// Meldet sich beim Peer aus dem Token an und wartet auf `ConnectionAck`
    pub fn request_connection(&self, token: &str) -> Result<JoinHandle<()>, ServiceError> {
        let token = self.checked(token.parse::<PairingToken>())?;

        let engine = Arc::clone(&self.engine);
        let client = Arc::clone(&self.client);
        let known_peer = Arc::clone(&self.known_peer);
        let event_tx = self.event_tx.clone();

        Ok(tokio::spawn(async move {
            let host = token.host();
            match client.request_connection(token.socket_addr()).await {
                Ok(_) => {
                    // Während eines Anrufs bleibt der Anruf-Peer das Ziel
                    if engine.adopt_messaging_peer(&host).await {
                        *known_peer.lock() = Some((host.clone(), token.port()));
                    }
                    let _ = event_tx.send(CallEvent::ConnectionEstablished { from: host.clone() });
                    let _ = event_tx.send(CallEvent::ConnectionStatusChanged(format!(
                        "Connected to {}",
                        host
                    )));
                }
                Err(e) => {
                    tracing::warn!("Connection request to {} failed: {}", token, e);
                    let _ = event_tx.send(CallEvent::CallError(describe_failure(&e)));
                }
            }
        }))
    }

    /// Gespeicherter Verlauf mit einem Peer
    pub fn conversation(&self, peer: &str) -> Result<Vec<StoredMessage>, ServiceError> {
        let history = self.history.as_ref().ok_or(ServiceError::HistoryDisabled)?;
        Ok(history.conversation(peer)?)
    }

    /// Löscht den Verlauf mit einem Peer, gibt die Anzahl gelöschter Nachrichten zurück
    pub fn clear_conversation(&self, peer: &str) -> Result<usize, ServiceError> {
        let history = self.history.as_ref().ok_or(ServiceError::HistoryDisabled)?;
        Ok(history.clear_conversation(peer)?)
    }

    // ========================================================================
    // PAIRING
    // ========================================================================

    /// Token für den eigenen QR-Code
    pub fn pairing_token(&self) -> Option<PairingToken> {
        let ip = self.local_address.local_ipv4()?;
        let port = self
            .listen_addr
            .lock()
            .map(|addr| addr.port())
            .unwrap_or(self.config.control_port);
        PairingToken::from_parts(&ip, port as u32).ok()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Meldet ungültige Adressen als CallError
    fn checked<T>(&self, result: Result<T, TokenError>) -> Result<T, ServiceError> {
        result.map_err(|e| {
            tracing::warn!("Rejected address: {}", e);
            self.emit(CallEvent::CallError(format!("Invalid address: {}", e)));
            ServiceError::InvalidAddress(e)
        })
    }

    /// CallDecline/CallEnd an den Peer, Fehler werden nur geloggt
    fn notify_peer(&self, remote: &str, payload: Payload) {
        let target = match control_addr(&self.known_peer, remote, self.config.control_port) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("Cannot notify {}: {}", remote, e);
                return;
            }
        };
        let client = Arc::clone(&self.client);

        tokio::spawn(async move {
            let msg_type = payload.message_type();
            if let Err(e) = client.notify(target, payload).await {
                tracing::warn!("Failed to send {} to {}: {}", msg_type, target, e);
            }
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for CallService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("listen_addr", &*self.listen_addr.lock())
            .field("engine", &self.engine)
            .finish()
    }
}

/// Control-Adresse eines Peers; der Port aus dem Token gilt nur für dessen IP
fn control_addr(known_peer: &KnownPeer, remote: &str, default_port: u16) -> Result<SocketAddr, TokenError> {
    let ip = parse_ipv4(remote)?;
    let port = match known_peer.lock().as_ref() {
        Some((known_ip, port)) if known_ip == remote => *port,
        _ => default_port,
    };
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Kurze Statuszeile für fehlgeschlagene Verbindungen
fn describe_failure(error: &SignalingError) -> String {
    match error {
        SignalingError::ConnectTimeout(_) => "Connection timed out".to_string(),
        SignalingError::ReadTimeout(_) => "No response from peer".to_string(),
        other => format!("Connection failed: {}", other),
    }
}

// ============================================================================
// TESTS
// ============================================================================
