//! UDP Audio Relay
//!
//! Zwei Tasks pro Anruf:
//! - Send-Loop: liest einen Frame vom Mikrofon und schickt ihn als Datagramm
//!   an den Audio-Port des Peers (stumm geschaltet: gelesen, nicht gesendet)
//! - Receive-Loop: empfängt Datagramme und gibt sie 1:1 an die Wiedergabe
//!
//! Beide Loops laufen, solange das `active`-Flag gesetzt ist. `stop()` holt
//! die Geräte-Handles von den Tasks zurück und gibt sie in fester
//! Reihenfolge frei: Capture, Playback, Socket, Call-Mode.

use super::audio::{AudioBackend, AudioCapture, AudioFormat, AudioPlayback};
use super::engine::CallEngineError;
use crate::events::CallEvent;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Größtes Datagramm, das der Receive-Loop annimmt
const MAX_DATAGRAM: usize = 8192;

/// Log-Intervall in Paketen
const LOG_EVERY: u64 = 100;

/// Lokale Bind-Adresse und Ziel des Relays
#[derive(Debug, Clone, Copy)]
pub struct RelayEndpoints {
    pub bind: SocketAddr,
    pub remote: SocketAddr,
}

/// Gemeinsame Flags zwischen Engine und Loops
#[derive(Clone)]
pub struct RelayFlags {
    pub active: Arc<AtomicBool>,
    pub muted: Arc<AtomicBool>,
}

pub struct AudioRelay {
    socket: Arc<UdpSocket>,
    backend: Arc<dyn AudioBackend>,
    active: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    send_task: JoinHandle<Box<dyn AudioCapture>>,
    recv_task: JoinHandle<Box<dyn AudioPlayback>>,
}

impl AudioRelay {
    /// Bindet die UDP-Socket, öffnet die Geräte und startet beide Loops
    pub async fn start(
        backend: Arc<dyn AudioBackend>,
        format: AudioFormat,
        endpoints: RelayEndpoints,
        flags: RelayFlags,
        events: broadcast::Sender<CallEvent>,
    ) -> Result<Self, CallEngineError> {
        let socket = Arc::new(UdpSocket::bind(endpoints.bind).await?);
        tracing::info!(
            "Audio socket bound to {}, sending to {}",
            socket.local_addr()?,
            endpoints.remote
        );

        backend.enter_call_mode()?;

        let mut capture = match backend.open_capture(&format) {
            Ok(capture) => capture,
            Err(e) => {
                let _ = backend.exit_call_mode();
                return Err(e.into());
            }
        };
        let playback = match backend.open_playback(&format) {
            Ok(playback) => playback,
            Err(e) => {
                let _ = capture.release();
                let _ = backend.exit_call_mode();
                return Err(e.into());
            }
        };

        flags.active.store(true, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let send_task = tokio::spawn(send_loop(
            capture,
            Arc::clone(&socket),
            endpoints.remote,
            format,
            flags.clone(),
            shutdown_rx.clone(),
            events.clone(),
        ));
        let recv_task = tokio::spawn(receive_loop(
            playback,
            Arc::clone(&socket),
            endpoints.remote.ip(),
            Arc::clone(&flags.active),
            shutdown_rx,
            events,
        ));

        Ok(Self {
            socket,
            backend,
            active: flags.active,
            shutdown_tx,
            send_task,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Beide Loops laufen noch
    pub fn is_running(&self) -> bool {
        !self.send_task.is_finished() && !self.recv_task.is_finished()
    }

    /// Stoppt die Loops und gibt alle Ressourcen frei
    ///
    /// Fehler beim Freigeben werden nur geloggt.
    pub async fn stop(self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let capture = match self.send_task.await {
            Ok(capture) => Some(capture),
            Err(e) => {
                tracing::warn!("Audio send task failed: {}", e);
                None
            }
        };
        let playback = match self.recv_task.await {
            Ok(playback) => Some(playback),
            Err(e) => {
                tracing::warn!("Audio receive task failed: {}", e);
                None
            }
        };

        if let Some(mut capture) = capture {
            if let Err(e) = capture.release() {
                tracing::warn!("Failed to release capture: {}", e);
            }
        }
        if let Some(mut playback) = playback {
            if let Err(e) = playback.release() {
                tracing::warn!("Failed to release playback: {}", e);
            }
        }

        drop(self.socket);

        if let Err(e) = self.backend.exit_call_mode() {
            tracing::warn!("Failed to restore audio routing: {}", e);
        }

        tracing::info!("Audio relay stopped");
    }
}

async fn send_loop(
    mut capture: Box<dyn AudioCapture>,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    format: AudioFormat,
    flags: RelayFlags,
    mut shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<CallEvent>,
) -> Box<dyn AudioCapture> {
    let mut buffer = vec![0u8; format.frame_bytes()];
    let mut sequence: u64 = 0;

    tracing::debug!("Audio send loop started");

    while flags.active.load(Ordering::SeqCst) {
        match capture.read(&mut buffer) {
            Ok(n) if n > 0 && !flags.muted.load(Ordering::SeqCst) => {
                if let Err(e) = socket.send_to(&buffer[..n], remote).await {
                    tracing::error!("Audio send failed: {}", e);
                    let _ = events.send(CallEvent::ConnectionStatusChanged(format!(
                        "Audio send stopped: {}",
                        e
                    )));
                    break;
                }
                if sequence % LOG_EVERY == 0 {
                    tracing::debug!("Sent audio packet #{} ({} bytes)", sequence, n);
                }
                sequence += 1;
            }
            // Kein Frame verfügbar oder stumm
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Audio capture failed: {}", e);
                let _ = events.send(CallEvent::ConnectionStatusChanged(format!(
                    "Audio capture stopped: {}",
                    e
                )));
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(format.frame_duration) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Audio send loop ended after {} packets", sequence);
    capture
}

async fn receive_loop(
    mut playback: Box<dyn AudioPlayback>,
    socket: Arc<UdpSocket>,
    remote_ip: IpAddr,
    active: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<CallEvent>,
) -> Box<dyn AudioPlayback> {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    let mut received: u64 = 0;

    tracing::debug!("Audio receive loop started");

    while active.load(Ordering::SeqCst) {
        let result = tokio::select! {
            result = socket.recv_from(&mut buffer) => result,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok((n, from)) => {
                if from.ip() != remote_ip {
                    tracing::trace!("Dropping audio datagram from {}", from);
                    continue;
                }
                if let Err(e) = playback.write(&buffer[..n]) {
                    tracing::error!("Audio playback failed: {}", e);
                    let _ = events.send(CallEvent::ConnectionStatusChanged(format!(
                        "Audio playback stopped: {}",
                        e
                    )));
                    break;
                }
                if received % LOG_EVERY == 0 {
                    tracing::debug!("Received audio packet #{} ({} bytes)", received, n);
                }
                received += 1;
            }
            Err(e) => {
                tracing::error!("Audio receive failed: {}", e);
                let _ = events.send(CallEvent::ConnectionStatusChanged(format!(
                    "Audio receive stopped: {}",
                    e
                )));
                break;
            }
        }
    }

    tracing::debug!("Audio receive loop ended after {} packets", received);
    playback
}
