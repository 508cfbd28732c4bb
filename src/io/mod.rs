//! IO modules - external system interfaces
//!
//! - `reader` - TCP link to the RFID reader and the link seam used by the tracker
//! - `simulator` - Simulated reader for running without hardware
//! - `name_store` - SQLite-backed tag display names
//! - `prometheus` - Prometheus text exposition
//! - `api` - HTTP control surface and WebSocket snapshot stream

pub mod api;
pub mod name_store;
pub mod prometheus;
pub mod reader;
pub mod simulator;

// Re-export commonly used types
pub use api::{start_api_server, ApiContext};
pub use name_store::{CachedNameStore, NameStore, SqliteNameStore, StoreError};
pub use reader::{DefaultLinkFactory, LinkFactory, ReaderError, ReaderLink, TcpReaderLink};
pub use simulator::SimulatedReader;
