//! LanCall Konsole
//!
//! Startet den Call-Service und liest Befehle von stdin:
//!
//! ```text
//! call <token>      Anruf an lancall://ip:port
//! connect <token>   Verbindung für Nachrichten herstellen
//! answer | decline | end | mute
//! msg <text>        Nachricht an den aktuellen Peer
//! history [ip]      Verlauf anzeigen
//! clear [ip]        Verlauf löschen
//! status | quit
//! ```

use anyhow::Context;
use lancall::{
    CallEventSink, CallService, CallState, CpalAudioBackend, LanCallConfig, SystemLocalAddress,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Gibt Events auf der Konsole aus
struct ConsoleSink;

impl CallEventSink for ConsoleSink {
    fn on_incoming_call(&self, from: &str) {
        println!("Incoming call from {} (answer/decline)", from);
    }

    fn on_call_connected(&self) {
        println!("Call connected");
    }

    fn on_call_ended(&self) {
        println!("Call ended");
    }

    fn on_call_error(&self, message: &str) {
        println!("Error: {}", message);
    }

    fn on_text_message_received(&self, from: &str, text: &str) {
        println!("[{}] {}", from, text);
    }

    fn on_connection_established(&self, from: &str) {
        println!("Connected to {}", from);
    }

    fn on_message_send_failed(&self, message: &str) {
        println!("Message not sent: {}", message);
    }

    fn on_state_changed(&self, state: CallState) {
        tracing::debug!("State: {}", state);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lancall::init_logging();

    let config = LanCallConfig::from_env().context("Invalid configuration")?;
    let service = CallService::new(
        config,
        Arc::new(CpalAudioBackend),
        Arc::new(SystemLocalAddress),
    )
    .context("Failed to create call service")?;

    service.set_event_sink(Some(Arc::new(ConsoleSink)));
    service.start().await.context("Failed to start call service")?;

    match service.pairing_token() {
        Some(token) => println!("Pairing token: {}", token),
        None => println!("No LAN address found, pairing token unavailable"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();

        let result = match command {
            "" => Ok(()),
            "call" => service.place_call_to(arg).await.map(|_| ()),
            "connect" => service.request_connection(arg).map(|_| ()),
            "answer" => service.answer().await,
            "decline" => service.decline().await,
            "end" => {
                service.end().await;
                Ok(())
            }
            "mute" => {
                let muted = service.toggle_mute();
                println!("{}", if muted { "Muted" } else { "Unmuted" });
                Ok(())
            }
            "msg" => service.send_text(arg).map(|_| ()),
            "history" => {
                let peer = if arg.is_empty() {
                    service.remote_address().unwrap_or_default()
                } else {
                    arg.to_string()
                };
                service.conversation(&peer).map(|messages| {
                    for message in messages {
                        println!("{:?} {}: {}", message.direction, message.sender_ip, message.text);
                    }
                })
            }
            "clear" => {
                let peer = if arg.is_empty() {
                    service.remote_address().unwrap_or_default()
                } else {
                    arg.to_string()
                };
                service
                    .clear_conversation(&peer)
                    .map(|deleted| println!("Deleted {} messages", deleted))
            }
            "status" => {
                let session = service.session();
                println!(
                    "{} (remote: {}, muted: {})",
                    session.state,
                    session.remote_address.as_deref().unwrap_or("-"),
                    session.muted
                );
                Ok(())
            }
            "quit" | "exit" => break,
            other => {
                println!("Unknown command: {}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::debug!("Command '{}' failed: {}", command, e);
        }
    }

    service.end().await;
    service.shutdown().await;
    Ok(())
}
