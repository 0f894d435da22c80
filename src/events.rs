//! Events des Call-Service
//!
//! Alle Komponenten publizieren in einen gemeinsamen `broadcast`-Kanal.
//! Ein UI-Kollaborator kann entweder selbst `subscribe()` nutzen oder genau
//! einen `CallEventSink` registrieren; der Dispatcher ruft den Sink von einem
//! einzigen Task aus in Publikations-Reihenfolge auf.

use crate::call_engine::CallState;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Kapazität des Event-Kanals
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Alles, was der Call-Service nach außen meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Eingehender Anruf wartet auf answer/decline
    IncomingCall { from: String },
    CallConnected,
    CallEnded,
    CallError(String),
    TextMessageReceived { from: String, text: String },
    /// Peer hat eine Verbindungsanfrage bestätigt (oder wir seine)
    ConnectionEstablished { from: String },
    MessageSent { to: String },
    MessageSendFailed(String),
    /// Kurze Statuszeile, z.B. für eine Benachrichtigung
    ConnectionStatusChanged(String),
    StateChanged(CallState),
}

/// Empfänger für Events; alle Methoden sind optional
pub trait CallEventSink: Send + Sync {
    fn on_incoming_call(&self, _from: &str) {}
    fn on_call_connected(&self) {}
    fn on_call_ended(&self) {}
    fn on_call_error(&self, _message: &str) {}
    fn on_text_message_received(&self, _from: &str, _text: &str) {}
    fn on_connection_established(&self, _from: &str) {}
    fn on_message_sent(&self, _to: &str) {}
    fn on_message_send_failed(&self, _message: &str) {}
    fn on_connection_status_changed(&self, _status: &str) {}
    fn on_state_changed(&self, _state: CallState) {}
}

/// Ruft die passende Sink-Methode für ein Event auf
pub fn deliver(sink: &dyn CallEventSink, event: &CallEvent) {
    match event {
        CallEvent::IncomingCall { from } => sink.on_incoming_call(from),
        CallEvent::CallConnected => sink.on_call_connected(),
        CallEvent::CallEnded => sink.on_call_ended(),
        CallEvent::CallError(message) => sink.on_call_error(message),
        CallEvent::TextMessageReceived { from, text } => sink.on_text_message_received(from, text),
        CallEvent::ConnectionEstablished { from } => sink.on_connection_established(from),
        CallEvent::MessageSent { to } => sink.on_message_sent(to),
        CallEvent::MessageSendFailed(message) => sink.on_message_send_failed(message),
        CallEvent::ConnectionStatusChanged(status) => sink.on_connection_status_changed(status),
        CallEvent::StateChanged(state) => sink.on_state_changed(*state),
    }
}

/// Slot für den aktuell registrierten Sink
pub type SinkSlot = Arc<RwLock<Option<Arc<dyn CallEventSink>>>>;

/// Startet den Dispatcher-Task für den Sink-Slot
pub fn spawn_dispatcher(mut events: broadcast::Receiver<CallEvent>, slot: SinkSlot) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    // Lock nicht während des Callbacks halten
                    let sink = slot.read().clone();
                    if let Some(sink) = sink {
                        deliver(sink.as_ref(), &event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event sink lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("Event dispatcher stopped");
    })
}
