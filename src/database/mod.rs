//! Database Module - lokaler Nachrichtenverlauf

mod history;

pub use history::{DatabaseError, Direction, MessageHistory, StoredMessage};
