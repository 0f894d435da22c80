//! Call Engine Module - State Machine und Audio
//!
//! Dieses Modul verwaltet:
//! - Den Zustand des (einzigen) Anrufs
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher)
//! - Den UDP-Relay für rohes PCM zwischen beiden Geräten

mod audio;
mod engine;
mod relay;

#[cfg(test)]
pub(crate) mod fake;

pub use audio::{
    AudioBackend, AudioCapture, AudioError, AudioFormat, AudioPlayback, CpalAudioBackend, CHANNELS,
};
pub use engine::{CallEngine, CallEngineError, CallSession, CallState};
pub use relay::{AudioRelay, RelayEndpoints, RelayFlags};
