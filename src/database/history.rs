//! Message History
//!
//! SQLite-Datenbank für den Nachrichtenverlauf.
//! Speichert gesendete und empfangene Textnachrichten pro Peer-IP.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

// ============================================================================
// MESSAGE STRUCT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    fn from_db(value: &str) -> Self {
        if value == "sent" {
            Direction::Sent
        } else {
            Direction::Received
        }
    }
}

/// Gespeicherte Textnachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    /// Gesprächspartner (unabhängig von der Richtung)
    pub peer_ip: String,
    pub sender_ip: String,
    pub text: String,
    pub direction: Direction,
    /// Unix-Millisekunden
    pub timestamp: i64,
    pub delivered: bool,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(StoredMessage {
            id: row.get(0)?,
            peer_ip: row.get(1)?,
            sender_ip: row.get(2)?,
            text: row.get(3)?,
            direction: Direction::from_db(&row.get::<_, String>(4)?),
            timestamp: row.get(5)?,
            delivered: row.get::<_, i32>(6)? != 0,
        })
    }
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Nachrichten (Thread-safe durch Mutex)
pub struct MessageHistory {
    conn: Mutex<Connection>,
}

impl MessageHistory {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening message history at {:?}", path);

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                peer_ip TEXT NOT NULL,
                sender_ip TEXT NOT NULL,
                text TEXT NOT NULL,
                direction TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_peer
                ON messages (peer_ip, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Speichert eine empfangene Nachricht
    pub fn record_received(&self, peer_ip: &str, text: &str) -> Result<StoredMessage, DatabaseError> {
        self.insert(StoredMessage {
            id: Uuid::new_v4().to_string(),
            peer_ip: peer_ip.to_string(),
            sender_ip: peer_ip.to_string(),
            text: text.to_string(),
            direction: Direction::Received,
            timestamp: Utc::now().timestamp_millis(),
            delivered: true,
        })
    }

    /// Speichert eine ausgehende Nachricht (noch nicht zugestellt)
    pub fn record_sent(
        &self,
        local_ip: &str,
        peer_ip: &str,
        text: &str,
    ) -> Result<StoredMessage, DatabaseError> {
        self.insert(StoredMessage {
            id: Uuid::new_v4().to_string(),
            peer_ip: peer_ip.to_string(),
            sender_ip: local_ip.to_string(),
            text: text.to_string(),
            direction: Direction::Sent,
            timestamp: Utc::now().timestamp_millis(),
            delivered: false,
        })
    }

    fn insert(&self, message: StoredMessage) -> Result<StoredMessage, DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO messages (id, peer_ip, sender_ip, text, direction, timestamp, delivered)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                message.id,
                message.peer_ip,
                message.sender_ip,
                message.text,
                message.direction.as_str(),
                message.timestamp,
                message.delivered as i32
            ],
        )?;
        Ok(message)
    }

    /// Markiert eine gesendete Nachricht als zugestellt
    pub fn mark_delivered(&self, id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE messages SET delivered = 1 WHERE id = ?1",
            params![id],
        )?;
        if updated == 0 {
            return Err(DatabaseError::MessageNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Verlauf mit einem Peer, älteste zuerst
    pub fn conversation(&self, peer_ip: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, peer_ip, sender_ip, text, direction, timestamp, delivered
            FROM messages
            WHERE peer_ip = ?1
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )?;

        let messages = stmt
            .query_map(params![peer_ip], StoredMessage::from_row)?
            .collect::<SqliteResult<Vec<StoredMessage>>>()?;

        Ok(messages)
    }

    /// Löscht den Verlauf mit einem Peer
    pub fn clear_conversation(&self, peer_ip: &str) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM messages WHERE peer_ip = ?1", params![peer_ip])?;
        Ok(deleted)
    }
}

impl std::fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHistory").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
