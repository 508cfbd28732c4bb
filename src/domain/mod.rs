//! Domain models - core presence types
//!
//! - `TagId` - identifier reported by the RFID reader
//! - `ConnectionState` - reader session state machine value
//! - `TagSighting` / `PresenceSnapshot` - derived presence view
//! - `LogEntry` - operator-visible log line

pub mod types;

pub use types::{
    ConnectionState, LogEntry, PresenceSnapshot, Severity, TagId, TagSighting,
};
