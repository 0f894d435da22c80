//! LanCall - Voice Calls und Textnachrichten im lokalen Netz
//!
//! Zwei Geräte im selben LAN telefonieren ohne Server:
//! - TCP Control-Channel (Port 10001) für Anruf-Signaling und Text
//! - UDP (Port 10002) für rohes 16kHz PCM
//! - Pairing über `lancall://<ip>:<port>` Tokens (z.B. als QR-Code)
//! - SQLite für den lokalen Nachrichtenverlauf
//!
//! Einstiegspunkt ist [`CallService`].

pub mod call_engine;
pub mod config;
pub mod database;
pub mod events;
pub mod network;
pub mod service;
pub mod signaling;

pub use call_engine::{CallSession, CallState, CpalAudioBackend};
pub use config::LanCallConfig;
pub use events::{CallEvent, CallEventSink};
pub use network::{LocalAddress, SystemLocalAddress};
pub use service::{CallService, ServiceError};
pub use signaling::PairingToken;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Initialisiert Logging (mehrfacher Aufruf ist harmlos)
///
/// Standard ist `lancall=debug`; `RUST_LOG` ergänzt bzw. überschreibt das.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("lancall=debug"),
        };

        // Schlägt fehl, wenn der Host bereits einen Subscriber gesetzt hat
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
