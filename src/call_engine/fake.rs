//! Test-Backend ohne Audio-Hardware

use super::audio::{AudioBackend, AudioCapture, AudioError, AudioFormat, AudioPlayback};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liefert einen festen Frame (oder Stille) und zeichnet Wiedergabe auf
#[derive(Clone, Default)]
pub struct FakeAudioBackend {
    /// Inhalt jedes aufgenommenen Frames; `None` heißt "kein Frame verfügbar"
    pub frame: Option<Vec<u8>>,
    pub fail_capture: bool,
    pub played: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Reihenfolge von Freigaben und Routing-Wechseln
    pub log: Arc<Mutex<Vec<&'static str>>>,
    pub call_mode: Arc<AtomicBool>,
}

impl FakeAudioBackend {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_frame(frame: Vec<u8>) -> Self {
        Self {
            frame: Some(frame),
            ..Self::default()
        }
    }

    pub fn failing_capture() -> Self {
        Self {
            fail_capture: true,
            ..Self::default()
        }
    }
}

impl AudioBackend for FakeAudioBackend {
    fn open_capture(&self, _format: &AudioFormat) -> Result<Box<dyn AudioCapture>, AudioError> {
        if self.fail_capture {
            return Err(AudioError::NoInputDevice);
        }
        Ok(Box::new(FakeCapture {
            frame: self.frame.clone(),
            log: Arc::clone(&self.log),
        }))
    }

    fn open_playback(&self, _format: &AudioFormat) -> Result<Box<dyn AudioPlayback>, AudioError> {
        Ok(Box::new(FakePlayback {
            played: Arc::clone(&self.played),
            log: Arc::clone(&self.log),
        }))
    }

    fn enter_call_mode(&self) -> Result<(), AudioError> {
        self.call_mode.store(true, Ordering::SeqCst);
        self.log.lock().push("enter_call_mode");
        Ok(())
    }

    fn exit_call_mode(&self) -> Result<(), AudioError> {
        self.call_mode.store(false, Ordering::SeqCst);
        self.log.lock().push("exit_call_mode");
        Ok(())
    }
}

struct FakeCapture {
    frame: Option<Vec<u8>>,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl AudioCapture for FakeCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        match &self.frame {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.log.lock().push("release_capture");
        Ok(())
    }
}

struct FakePlayback {
    played: Arc<Mutex<Vec<Vec<u8>>>>,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl AudioPlayback for FakePlayback {
    fn write(&mut self, buf: &[u8]) -> Result<usize, AudioError> {
        self.played.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.log.lock().push("release_playback");
        Ok(())
    }
}
