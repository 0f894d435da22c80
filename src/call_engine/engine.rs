//! Call Engine
//!
//! State Machine eines einzelnen Anrufs:
//!
//! ```text
//! Idle/Ended --place--> Outgoing --settle--> Connected --end--> Ended --500ms--> Idle
//! Idle/Ended --CallRequest--> Incoming --answer--> Connected
//!                                     --decline--> Ended
//! ```
//!
//! Jeder Übergang läuft unter einem async Transition-Lock, damit
//! "State lesen, dann handeln" atomar bleibt, auch wenn UI-Befehle und
//! eingehende Signaling-Nachrichten gleichzeitig eintreffen. Befehle im
//! falschen Zustand ändern nichts und melden `CallError`.

use super::audio::{AudioBackend, AudioError, AudioFormat};
use super::relay::{AudioRelay, RelayEndpoints, RelayFlags};
use crate::config::LanCallConfig;
use crate::events::CallEvent;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Cannot {action} while {state}")]
    InvalidStateTransition {
        action: &'static str,
        state: CallState,
    },

    #[error("Invalid remote address: {0}")]
    InvalidRemote(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Eingehender Anruf wartet auf Antwort
    Incoming,
    /// Ausgehender Anruf wird aufgebaut
    Outgoing,
    /// Anruf aktiv, Audio läuft
    Connected,
    /// Anruf beendet, kurz vor Reset auf Idle
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Incoming => "incoming",
            CallState::Outgoing => "outgoing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Neuer Anruf oder Messaging-Ziel erlaubt
    fn is_available(&self) -> bool {
        matches!(self, CallState::Idle | CallState::Ended)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Momentaufnahme der Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub state: CallState,
    pub remote_address: Option<String>,
    pub muted: bool,
    pub active: bool,
}

struct SessionData {
    state: CallState,
    /// Bleibt nach Anrufende für Textnachrichten erhalten
    remote_address: Option<String>,
    /// Wird mit jedem neuen Anruf erhöht
    call_id: u64,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    data: Arc<Mutex<SessionData>>,
    transition: Arc<tokio::sync::Mutex<()>>,
    flags: RelayFlags,
    relay: Mutex<Option<AudioRelay>>,
    audio: Arc<dyn AudioBackend>,
    format: AudioFormat,
    audio_port: u16,
    reset_delay: Duration,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    pub fn new(
        audio: Arc<dyn AudioBackend>,
        config: &LanCallConfig,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            data: Arc::new(Mutex::new(SessionData {
                state: CallState::Idle,
                remote_address: None,
                call_id: 0,
            })),
            transition: Arc::new(tokio::sync::Mutex::new(())),
            flags: RelayFlags {
                active: Arc::new(AtomicBool::new(false)),
                muted: Arc::new(AtomicBool::new(false)),
            },
            relay: Mutex::new(None),
            audio,
            format: AudioFormat::voice(config.sample_rate, config.frame_duration),
            audio_port: config.audio_port,
            reset_delay: config.reset_delay,
            event_tx,
        }
    }

    /// Abonniert Events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt den aktuellen State zurück
    pub fn state(&self) -> CallState {
        self.data.lock().state
    }

    pub fn remote_address(&self) -> Option<String> {
        self.data.lock().remote_address.clone()
    }

    pub fn session(&self) -> CallSession {
        let data = self.data.lock();
        CallSession {
            state: data.state,
            remote_address: data.remote_address.clone(),
            muted: self.is_muted(),
            active: self.is_active(),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.flags.muted.load(Ordering::SeqCst)
    }

    /// Schaltet Mute um und gibt den neuen Status zurück
    ///
    /// Gilt sofort für den laufenden Send-Loop und auch außerhalb eines Anrufs.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.flags.muted.fetch_xor(true, Ordering::SeqCst);
        tracing::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    /// Audio-Loops sollen laufen
    pub fn is_active(&self) -> bool {
        self.flags.active.load(Ordering::SeqCst)
    }

    /// Relay existiert und beide Loops laufen
    pub fn relay_running(&self) -> bool {
        self.relay
            .lock()
            .as_ref()
            .map(|relay| relay.is_running())
            .unwrap_or(false)
    }

    // ========================================================================
    // OUTGOING
    // ========================================================================

    /// Startet einen ausgehenden Anruf (Idle/Ended -> Outgoing)
    ///
    /// Gibt die Call-ID zurück, die `complete_outgoing`/`fail_outgoing`
    /// erwarten.
    pub async fn begin_outgoing(&self, remote: &str) -> Result<u64, CallEngineError> {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if !state.is_available() {
            return Err(self.reject("place a call", state));
        }

        let call_id = self.next_call(remote);
        self.set_state(CallState::Outgoing);
        self.status(format!("Calling {}...", remote));
        Ok(call_id)
    }

    /// CallRequest wurde zugestellt und die Wartezeit ist um
    ///
    /// Wurde der Anruf inzwischen beendet, abgelehnt oder durch einen neuen
    /// ersetzt, passiert nichts.
    pub async fn complete_outgoing(&self, call_id: u64) -> Result<(), CallEngineError> {
        let _guard = self.transition.lock().await;
        if !self.is_pending_outgoing(call_id) {
            let state = self.state();
            tracing::debug!("Outgoing call {} no longer pending ({})", call_id, state);
            return Err(CallEngineError::InvalidStateTransition {
                action: "connect",
                state,
            });
        }
        self.connect_locked().await
    }

    /// CallRequest konnte nicht zugestellt werden
    pub async fn fail_outgoing(&self, call_id: u64, message: String) {
        let _guard = self.transition.lock().await;
        if !self.is_pending_outgoing(call_id) {
            tracing::debug!("Ignoring failure of stale call {}: {}", call_id, message);
            return;
        }

        tracing::warn!("Outgoing call failed: {}", message);
        self.set_state(CallState::Ended);
        self.emit(CallEvent::CallError(message));
        self.schedule_reset();
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    /// Registriert einen eingehenden Anruf (Idle/Ended -> Incoming)
    ///
    /// Ein wiederholter CallRequest desselben Peers während Incoming wird
    /// ignoriert; jeder andere Zustand gilt als besetzt.
    pub async fn register_incoming_call(&self, peer: &str) -> Result<(), CallEngineError> {
        let _guard = self.transition.lock().await;
        let (state, remote) = {
            let data = self.data.lock();
            (data.state, data.remote_address.clone())
        };

        if state == CallState::Incoming && remote.as_deref() == Some(peer) {
            tracing::debug!("Duplicate call request from {}", peer);
            return Ok(());
        }
        if !state.is_available() {
            tracing::info!("Busy ({}), rejecting call from {}", state, peer);
            return Err(CallEngineError::InvalidStateTransition {
                action: "accept an incoming call",
                state,
            });
        }

        self.next_call(peer);
        self.set_state(CallState::Incoming);
        self.emit(CallEvent::IncomingCall {
            from: peer.to_string(),
        });
        self.status(format!("Incoming call from {}", peer));
        Ok(())
    }

    /// Nimmt den eingehenden Anruf an (Incoming -> Connected)
    pub async fn answer(&self) -> Result<(), CallEngineError> {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if state != CallState::Incoming {
            return Err(self.reject("answer", state));
        }
        self.connect_locked().await
    }

    /// Lehnt den eingehenden Anruf ab (Incoming -> Ended)
    ///
    /// Gibt die Adresse des Anrufers zurück.
    pub async fn decline(&self) -> Result<String, CallEngineError> {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if state != CallState::Incoming {
            return Err(self.reject("decline", state));
        }

        let remote = self.remote_address().unwrap_or_default();
        tracing::info!("Declined call from {}", remote);
        self.finish_locked().await;
        Ok(remote)
    }

    // ========================================================================
    // ENDING
    // ========================================================================

    /// Beendet den Anruf (Connected/Outgoing -> Ended)
    ///
    /// Ohne laufenden Anruf ein No-op. Gibt die Adresse des Peers zurück,
    /// wenn tatsächlich ein Anruf beendet wurde.
    pub async fn end_call(&self) -> Option<String> {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if !matches!(state, CallState::Connected | CallState::Outgoing) {
            tracing::debug!("No call to end ({})", state);
            return None;
        }

        let remote = self.remote_address();
        tracing::info!("Ending call with {}", remote.as_deref().unwrap_or("?"));
        self.finish_locked().await;
        remote
    }

    /// Peer hat aufgelegt (`CallEnd`)
    pub async fn remote_ended(&self, peer: &str) -> bool {
        self.finish_from_remote(peer, "hung up").await
    }

    /// Peer hat abgelehnt (`CallDecline`)
    pub async fn remote_declined(&self, peer: &str) -> bool {
        self.finish_from_remote(peer, "declined").await
    }

    async fn finish_from_remote(&self, peer: &str, reason: &str) -> bool {
        let _guard = self.transition.lock().await;
        let (state, remote) = {
            let data = self.data.lock();
            (data.state, data.remote_address.clone())
        };

        let in_call = matches!(
            state,
            CallState::Incoming | CallState::Outgoing | CallState::Connected
        );
        if !in_call || remote.as_deref() != Some(peer) {
            tracing::debug!("Ignoring remote {} from {} ({})", reason, peer, state);
            return false;
        }

        tracing::info!("Peer {} {}", peer, reason);
        self.finish_locked().await;
        true
    }

    /// Stoppt ein laufendes Relay, ohne Events zu senden
    pub async fn shutdown(&self) {
        let _guard = self.transition.lock().await;
        let relay = self.relay.lock().take();
        if let Some(relay) = relay {
            relay.stop().await;
        }
    }

    // ========================================================================
    // MESSAGING
    // ========================================================================

    /// Setzt den Peer für Textnachrichten, ohne Anruf
    pub async fn set_remote_for_messaging(&self, remote: &str) -> Result<(), CallEngineError> {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if !state.is_available() {
            return Err(self.reject("change the messaging peer", state));
        }

        self.store_messaging_peer(remote);
        Ok(())
    }

    /// Wie `set_remote_for_messaging`, aber still: während eines Anrufs
    /// bleibt der Peer unverändert und es gibt kein Event
    pub async fn adopt_messaging_peer(&self, remote: &str) -> bool {
        let _guard = self.transition.lock().await;
        let state = self.state();
        if !state.is_available() {
            tracing::debug!("Keeping call peer, not adopting {} ({})", remote, state);
            return false;
        }

        self.store_messaging_peer(remote);
        true
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Neuer Anruf mit `remote`; gibt die neue Call-ID zurück
    fn next_call(&self, remote: &str) -> u64 {
        let mut data = self.data.lock();
        data.call_id += 1;
        data.remote_address = Some(remote.to_string());
        data.call_id
    }

    fn is_pending_outgoing(&self, call_id: u64) -> bool {
        let data = self.data.lock();
        data.state == CallState::Outgoing && data.call_id == call_id
    }

    fn store_messaging_peer(&self, remote: &str) {
        self.data.lock().remote_address = Some(remote.to_string());
        tracing::info!("Messaging peer set to {}", remote);
    }

    /// -> Connected, startet das Relay. Aufrufer hält den Transition-Lock.
    async fn connect_locked(&self) -> Result<(), CallEngineError> {
        let remote = self.remote_address().unwrap_or_default();
        let endpoints = match self.endpoints(&remote) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.abort_locked(&e);
                return Err(e);
            }
        };

        self.set_state(CallState::Connected);

        match AudioRelay::start(
            Arc::clone(&self.audio),
            self.format,
            endpoints,
            self.flags.clone(),
            self.event_tx.clone(),
        )
        .await
        {
            Ok(relay) => {
                *self.relay.lock() = Some(relay);
                tracing::info!("Call connected with {}", remote);
                self.emit(CallEvent::CallConnected);
                self.status(format!("In call with {}", remote));
                Ok(())
            }
            Err(e) => {
                self.abort_locked(&e);
                Err(e)
            }
        }
    }

    /// Audio konnte nicht gestartet werden
    fn abort_locked(&self, error: &CallEngineError) {
        tracing::error!("Failed to start call: {}", error);
        self.flags.active.store(false, Ordering::SeqCst);
        self.set_state(CallState::Ended);
        self.emit(CallEvent::CallError(format!("Failed to start audio: {}", error)));
        self.schedule_reset();
    }

    /// -> Ended, stoppt das Relay, meldet CallEnded. Aufrufer hält den Lock.
    async fn finish_locked(&self) {
        let relay = self.relay.lock().take();
        if let Some(relay) = relay {
            relay.stop().await;
        }
        self.flags.active.store(false, Ordering::SeqCst);

        self.set_state(CallState::Ended);
        self.emit(CallEvent::CallEnded);
        self.status("Call ended".to_string());
        self.schedule_reset();
    }

    fn endpoints(&self, remote: &str) -> Result<RelayEndpoints, CallEngineError> {
        let ip: IpAddr = remote
            .parse()
            .map_err(|_| CallEngineError::InvalidRemote(remote.to_string()))?;

        Ok(RelayEndpoints {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.audio_port),
            remote: SocketAddr::new(ip, self.audio_port),
        })
    }

    /// Ungültiger Befehl: loggen, CallError melden, nichts ändern
    fn reject(&self, action: &'static str, state: CallState) -> CallEngineError {
        let error = CallEngineError::InvalidStateTransition { action, state };
        tracing::warn!("{}", error);
        self.emit(CallEvent::CallError(error.to_string()));
        error
    }

    /// Kurz warten und dann auf Idle setzen, falls derselbe Anruf noch Ended ist
    fn schedule_reset(&self) {
        let data = Arc::clone(&self.data);
        let transition = Arc::clone(&self.transition);
        let event_tx = self.event_tx.clone();
        let delay = self.reset_delay;
        let call_id = self.data.lock().call_id;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _guard = transition.lock().await;

            let reset = {
                let mut data = data.lock();
                if data.state == CallState::Ended && data.call_id == call_id {
                    data.state = CallState::Idle;
                    true
                } else {
                    false
                }
            };
            if reset {
                let _ = event_tx.send(CallEvent::StateChanged(CallState::Idle));
            }
        });
    }

    /// Aktualisiert den State und sendet Event
    fn set_state(&self, new_state: CallState) {
        self.data.lock().state = new_state;
        tracing::debug!("Call state -> {}", new_state);
        self.emit(CallEvent::StateChanged(new_state));
    }

    fn status(&self, status: String) {
        self.emit(CallEvent::ConnectionStatusChanged(status));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("remote_address", &self.remote_address())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::fake::FakeAudioBackend;
    use crate::events::EVENT_CHANNEL_CAPACITY;

    fn test_engine(backend: FakeAudioBackend) -> (CallEngine, broadcast::Receiver<CallEvent>) {
        test_engine_with_reset(backend, Duration::from_millis(50))
    }

    fn test_engine_with_reset(
        backend: FakeAudioBackend,
        reset_delay: Duration,
    ) -> (CallEngine, broadcast::Receiver<CallEvent>) {
        let config = LanCallConfig {
            audio_port: 0,
            reset_delay,
            ..LanCallConfig::default()
        };
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (CallEngine::new(Arc::new(backend), &config, tx), rx)
    }

    /// Alle bisher gepufferten Events außer StateChanged/Status
    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CallEvent::StateChanged(_) | CallEvent::ConnectionStatusChanged(_) => {}
                other => events.push(other),
            }
        }
        events
    }

    #[tokio::test]
    async fn test_incoming_call_is_registered() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());

        engine.register_incoming_call("10.0.0.5").await.unwrap();

        assert_eq!(engine.state(), CallState::Incoming);
        assert_eq!(engine.remote_address().as_deref(), Some("10.0.0.5"));
        assert_eq!(
            drain(&mut rx),
            vec![CallEvent::IncomingCall {
                from: "10.0.0.5".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_answer_starts_audio_once() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        engine.register_incoming_call("127.0.0.1").await.unwrap();
        drain(&mut rx);

        engine.answer().await.unwrap();

        assert_eq!(engine.state(), CallState::Connected);
        assert!(engine.is_active());
        assert!(engine.relay_running());
        assert_eq!(drain(&mut rx), vec![CallEvent::CallConnected]);

        engine.end_call().await;
    }

    #[tokio::test]
    async fn test_answer_without_incoming_is_rejected() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());

        let err = engine.answer().await.unwrap_err();

        assert!(matches!(
            err,
            CallEngineError::InvalidStateTransition {
                state: CallState::Idle,
                ..
            }
        ));
        assert_eq!(engine.state(), CallState::Idle);
        assert!(engine.remote_address().is_none());
        assert!(!engine.is_active());
        assert!(matches!(drain(&mut rx).as_slice(), [CallEvent::CallError(_)]));
    }

    #[tokio::test]
    async fn test_end_twice_reports_once() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        engine.register_incoming_call("127.0.0.1").await.unwrap();
        engine.answer().await.unwrap();
        drain(&mut rx);

        assert_eq!(engine.end_call().await.as_deref(), Some("127.0.0.1"));
        assert_eq!(engine.end_call().await, None);

        assert_eq!(drain(&mut rx), vec![CallEvent::CallEnded]);
        assert_eq!(engine.state(), CallState::Ended);
        assert!(!engine.is_active());
        assert!(!engine.relay_running());
        // Peer bleibt für Nachrichten erhalten
        assert_eq!(engine.remote_address().as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_ended_resets_to_idle() {
        let (engine, _rx) = test_engine(FakeAudioBackend::silent());
        engine.register_incoming_call("10.0.0.5").await.unwrap();
        engine.decline().await.unwrap();
        assert_eq!(engine.state(), CallState::Ended);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_busy_while_in_call() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        engine.register_incoming_call("10.0.0.5").await.unwrap();
        drain(&mut rx);

        // Gleicher Peer: Duplikat, kein Event
        engine.register_incoming_call("10.0.0.5").await.unwrap();
        // Anderer Peer: besetzt
        assert!(engine.register_incoming_call("10.0.0.6").await.is_err());

        assert_eq!(engine.remote_address().as_deref(), Some("10.0.0.5"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_outgoing_flow() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());

        let call_id = engine.begin_outgoing("127.0.0.1").await.unwrap();
        assert_eq!(engine.state(), CallState::Outgoing);
        assert!(engine.begin_outgoing("127.0.0.1").await.is_err());

        engine.complete_outgoing(call_id).await.unwrap();
        assert_eq!(engine.state(), CallState::Connected);

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&CallEvent::CallConnected));
        engine.end_call().await;
    }

    #[tokio::test]
    async fn test_outgoing_declined_by_peer() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        let call_id = engine.begin_outgoing("10.0.0.7").await.unwrap();
        drain(&mut rx);

        // Fremder Peer wird ignoriert
        assert!(!engine.remote_declined("10.0.0.8").await);
        assert!(engine.remote_declined("10.0.0.7").await);
        assert_eq!(engine.state(), CallState::Ended);
        assert_eq!(drain(&mut rx), vec![CallEvent::CallEnded]);

        // Wartezeit endet danach: kein Connect mehr
        assert!(engine.complete_outgoing(call_id).await.is_err());
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_failed_outgoing_reports_error() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        let call_id = engine.begin_outgoing("10.0.0.7").await.unwrap();
        drain(&mut rx);

        engine.fail_outgoing(call_id, "Connection timed out".into()).await;

        assert_eq!(engine.state(), CallState::Ended);
        assert_eq!(
            drain(&mut rx),
            vec![CallEvent::CallError("Connection timed out".into())]
        );
    }

    #[tokio::test]
    async fn test_audio_failure_ends_call() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::failing_capture());
        engine.register_incoming_call("127.0.0.1").await.unwrap();
        drain(&mut rx);

        assert!(matches!(
            engine.answer().await,
            Err(CallEngineError::Audio(_))
        ));
        assert_eq!(engine.state(), CallState::Ended);
        assert!(!engine.is_active());
        assert!(matches!(drain(&mut rx).as_slice(), [CallEvent::CallError(_)]));
    }

    #[tokio::test]
    async fn test_toggle_mute() {
        let (engine, _rx) = test_engine(FakeAudioBackend::silent());
        assert!(!engine.is_muted());
        assert!(engine.toggle_mute());
        assert!(engine.is_muted());
        assert!(!engine.toggle_mute());
    }

    #[tokio::test]
    async fn test_messaging_peer_only_when_idle() {
        let (engine, _rx) = test_engine(FakeAudioBackend::silent());
        engine.set_remote_for_messaging("10.0.0.9").await.unwrap();
        assert_eq!(engine.remote_address().as_deref(), Some("10.0.0.9"));
        assert_eq!(engine.state(), CallState::Idle);

        engine.register_incoming_call("10.0.0.5").await.unwrap();
        assert!(engine.set_remote_for_messaging("10.0.0.9").await.is_err());
        assert_eq!(engine.remote_address().as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_stale_settle_does_not_touch_next_call() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        let first = engine.begin_outgoing("127.0.0.1").await.unwrap();
        engine.end_call().await;
        let second = engine.begin_outgoing("10.0.0.7").await.unwrap();
        assert_ne!(first, second);
        drain(&mut rx);

        // Wartezeit des ersten Anrufs läuft ab
        assert!(engine.complete_outgoing(first).await.is_err());
        assert_eq!(engine.state(), CallState::Outgoing);
        assert!(!engine.relay_running());
        assert!(drain(&mut rx).is_empty());

        // Fehler des zweiten Anrufs wird weiterhin gemeldet
        engine.fail_outgoing(second, "Connection timed out".into()).await;
        assert_eq!(engine.state(), CallState::Ended);
        assert_eq!(
            drain(&mut rx),
            vec![CallEvent::CallError("Connection timed out".into())]
        );
    }

    #[tokio::test]
    async fn test_stale_reset_keeps_next_call_ended() {
        let (engine, _rx) =
            test_engine_with_reset(FakeAudioBackend::silent(), Duration::from_millis(200));
        engine.begin_outgoing("10.0.0.7").await.unwrap();
        engine.end_call().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = engine.begin_outgoing("10.0.0.8").await.unwrap();
        engine.fail_outgoing(second, "Connection refused".into()).await;

        // Reset des ersten Anrufs ist fällig, der zweite noch nicht
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.state(), CallState::Ended);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.state(), CallState::Idle);
    }

    fn count(events: &[CallEvent], wanted: &CallEvent) -> usize {
        events.iter().filter(|event| *event == wanted).count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_answer_and_remote_end() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        engine.register_incoming_call("127.0.0.1").await.unwrap();
        drain(&mut rx);

        let (first, ended, second) = tokio::join!(
            engine.answer(),
            engine.remote_ended("127.0.0.1"),
            engine.answer()
        );

        // Lock ist fair: erst Annahme, dann Auflegen, dann Ablehnung
        assert!(first.is_ok());
        assert!(ended);
        assert!(second.is_err());

        let events = drain(&mut rx);
        assert_eq!(count(&events, &CallEvent::CallConnected), 1);
        assert_eq!(count(&events, &CallEvent::CallEnded), 1);
        assert_eq!(engine.state(), CallState::Ended);
        assert!(!engine.is_active());
        assert!(!engine.relay_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_answers_connect_once() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        let engine = Arc::new(engine);
        engine.register_incoming_call("127.0.0.1").await.unwrap();
        drain(&mut rx);

        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if i == 1 {
                        engine.remote_ended("127.0.0.1").await;
                    } else {
                        let _ = engine.answer().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let events = drain(&mut rx);
        assert!(count(&events, &CallEvent::CallConnected) <= 1);
        assert_eq!(count(&events, &CallEvent::CallEnded), 1);
        assert_eq!(engine.state(), CallState::Ended);
        assert!(!engine.is_active());
        assert!(!engine.relay_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_settle_racing_local_end() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        let engine = Arc::new(engine);
        let call_id = engine.begin_outgoing("127.0.0.1").await.unwrap();
        drain(&mut rx);

        let settle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.complete_outgoing(call_id).await.is_ok() })
        };
        let end = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.end_call().await })
        };
        let connected = settle.await.unwrap();
        assert_eq!(end.await.unwrap().as_deref(), Some("127.0.0.1"));

        let events = drain(&mut rx);
        assert_eq!(
            count(&events, &CallEvent::CallConnected),
            usize::from(connected)
        );
        assert_eq!(count(&events, &CallEvent::CallEnded), 1);
        assert_eq!(engine.state(), CallState::Ended);
        assert!(!engine.relay_running());
    }

    #[tokio::test]
    async fn test_adopt_messaging_peer_is_silent_in_call() {
        let (engine, mut rx) = test_engine(FakeAudioBackend::silent());
        engine.register_incoming_call("10.0.0.5").await.unwrap();
        drain(&mut rx);

        assert!(!engine.adopt_messaging_peer("10.0.0.9").await);
        assert_eq!(engine.remote_address().as_deref(), Some("10.0.0.5"));
        assert!(drain(&mut rx).is_empty());

        engine.decline().await.unwrap();
        assert!(engine.adopt_messaging_peer("10.0.0.9").await);
        assert_eq!(engine.remote_address().as_deref(), Some("10.0.0.9"));
    }
}
