//! Konfiguration
//!
//! Defaults entsprechen dem Wire-Protokoll älterer Clients (Ports 10001/10002,
//! 16 kHz Mono). Einzelne Werte lassen sich über Umgebungsvariablen
//! überschreiben:
//!
//! - `LANCALL_CONTROL_PORT`
//! - `LANCALL_AUDIO_PORT`
//! - `LANCALL_CALLER_NAME`
//! - `LANCALL_HISTORY` (Pfad zur Datenbank oder `off`)

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// TCP-Port des Control-Channels
pub const CONTROL_PORT: u16 = 10001;

/// UDP-Port für Audio
pub const AUDIO_PORT: u16 = 10002;

/// Sample Rate auf dem Wire (16kHz reicht für Sprache)
pub const SAMPLE_RATE: u32 = 16000;

/// Dauer eines Audio-Frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },

    #[error("Could not determine app data directory")]
    NoDataDir,
}

/// Retry-Policy für ausgehende Textnachrichten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Alle Einstellungen des Call-Service
#[derive(Debug, Clone)]
pub struct LanCallConfig {
    pub control_port: u16,
    pub audio_port: u16,
    pub sample_rate: u32,
    pub frame_duration: Duration,
    /// Name im `CallRequest`
    pub caller_name: String,

    /// Connect-Timeout für `CallRequest`
    pub call_connect_timeout: Duration,
    /// Wartezeit nach dem `CallRequest`, bevor der Anruf als verbunden gilt
    pub call_settle_delay: Duration,
    /// Lese-Deadline für eingehende Verbindungen
    pub inbound_read_timeout: Duration,
    /// Connect-Timeout für Textnachrichten
    pub message_connect_timeout: Duration,
    /// Schreib-Timeout für Textnachrichten
    pub message_io_timeout: Duration,
    /// Wartezeit auf `ConnectionAck`
    pub ack_timeout: Duration,
    pub message_retry: RetryPolicy,
    /// Verzögerung Ended -> Idle
    pub reset_delay: Duration,

    /// SQLite-Datei für den Nachrichtenverlauf, `None` deaktiviert ihn
    pub history_path: Option<PathBuf>,
}

impl Default for LanCallConfig {
    fn default() -> Self {
        Self {
            control_port: CONTROL_PORT,
            audio_port: AUDIO_PORT,
            sample_rate: SAMPLE_RATE,
            frame_duration: FRAME_DURATION,
            caller_name: "Caller".to_string(),
            call_connect_timeout: Duration::from_secs(10),
            call_settle_delay: Duration::from_secs(2),
            inbound_read_timeout: Duration::from_secs(5),
            message_connect_timeout: Duration::from_secs(5),
            message_io_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            message_retry: RetryPolicy::default(),
            reset_delay: Duration::from_millis(500),
            history_path: None,
        }
    }
}

impl LanCallConfig {
    /// Defaults plus Überschreibungen aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("LANCALL_CONTROL_PORT") {
            config.control_port = parse_port("LANCALL_CONTROL_PORT", &port)?;
        }
        if let Some(port) = lookup("LANCALL_AUDIO_PORT") {
            config.audio_port = parse_port("LANCALL_AUDIO_PORT", &port)?;
        }
        if let Some(name) = lookup("LANCALL_CALLER_NAME") {
            let name = name.trim();
            if !name.is_empty() {
                config.caller_name = name.to_string();
            }
        }

        config.history_path = match lookup("LANCALL_HISTORY") {
            Some(value) if value.eq_ignore_ascii_case("off") => None,
            Some(path) if !path.trim().is_empty() => Some(PathBuf::from(path.trim())),
            _ => Some(default_history_path()?),
        };

        Ok(config)
    }
}

fn parse_port(var: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
}

/// Ermittelt den Pfad zur Verlaufs-Datenbank
///
/// - Linux: `~/.local/share/lancall/messages.db`
/// - macOS: `~/Library/Application Support/com.lancall.lancall/messages.db`
/// - Windows: `%APPDATA%/lancall/lancall/data/messages.db`
fn default_history_path() -> Result<PathBuf, ConfigError> {
    let proj_dirs =
        directories::ProjectDirs::from("com", "lancall", "lancall").ok_or(ConfigError::NoDataDir)?;

    let mut path = proj_dirs.data_dir().to_path_buf();
    path.push("messages.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LanCallConfig::default();
        assert_eq!(config.control_port, 10001);
        assert_eq!(config.audio_port, 10002);
        assert_eq!(config.message_retry.max_attempts, 3);
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_duration, Duration::from_millis(20));
    }

    #[test]
    fn test_env_overrides() {
        let config = LanCallConfig::from_lookup(lookup(&[
            ("LANCALL_CONTROL_PORT", "20001"),
            ("LANCALL_AUDIO_PORT", "20002"),
            ("LANCALL_CALLER_NAME", "  Küche "),
            ("LANCALL_HISTORY", "off"),
        ]))
        .unwrap();

        assert_eq!(config.control_port, 20001);
        assert_eq!(config.audio_port, 20002);
        assert_eq!(config.caller_name, "Küche");
        assert!(config.history_path.is_none());
    }

    #[test]
    fn test_history_path_override() {
        let config =
            LanCallConfig::from_lookup(lookup(&[("LANCALL_HISTORY", "/tmp/lancall.db")])).unwrap();
        assert_eq!(config.history_path, Some(PathBuf::from("/tmp/lancall.db")));
    }

    #[test]
    fn test_invalid_port() {
        let err = LanCallConfig::from_lookup(lookup(&[
            ("LANCALL_CONTROL_PORT", "70000"),
            ("LANCALL_HISTORY", "off"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "LANCALL_CONTROL_PORT",
                ..
            }
        ));
    }
}
