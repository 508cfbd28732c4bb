//! Tag display names
//!
//! Single table of `(id, name)` pairs. Lookups never fail the caller: a missing
//! row reads as "Unknown Asset" and a failed query falls back to the raw id.
//!
//! Snapshots resolve every tag on each publish tick, so the binary wraps the
//! SQLite store in `CachedNameStore`. Renames go through the same wrapper and
//! keep the cache current.

use crate::domain::types::TagId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Name reported for tags that were never renamed
pub const UNKNOWN_NAME: &str = "Unknown Asset";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS rfid_names (id TEXT PRIMARY KEY, name TEXT)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("name store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub trait NameStore: Send + Sync {
    /// Raw lookup; `None` when the tag has no stored name
    fn lookup(&self, tag_id: &TagId) -> Result<Option<String>, StoreError>;

    /// Insert or replace the name for a tag
    fn store(&self, tag_id: &TagId, name: &str) -> Result<(), StoreError>;

    /// Display name with fallbacks; never fails
    fn get_name(&self, tag_id: &TagId) -> String {
        match self.lookup(tag_id) {
            Ok(Some(name)) => name,
            Ok(None) => UNKNOWN_NAME.to_string(),
            Err(e) => {
                warn!(tag_id = %tag_id, error = %e, "name_lookup_failed");
                tag_id.to_string()
            }
        }
    }

    /// Rename a tag, reporting success as a boolean
    fn set_name(&self, tag_id: &TagId, name: &str) -> bool {
        match self.store(tag_id, name) {
            Ok(()) => {
                info!(tag_id = %tag_id, name = %name, "tag_renamed");
                true
            }
            Err(e) => {
                warn!(tag_id = %tag_id, error = %e, "tag_rename_failed");
                false
            }
        }
    }
}

/// SQLite-backed name store
pub struct SqliteNameStore {
    conn: Mutex<Connection>,
}

impl SqliteNameStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(CREATE_TABLE, [])?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl NameStore for SqliteNameStore {
    fn lookup(&self, tag_id: &TagId) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let name = conn
            .query_row(
                "SELECT name FROM rfid_names WHERE id = ?1",
                params![tag_id.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    fn store(&self, tag_id: &TagId, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO rfid_names (id, name) VALUES (?1, ?2)",
            params![tag_id.as_str(), name],
        )?;
        Ok(())
    }
}

/// Read-through cache in front of another store
///
/// Only successful lookups are cached, including "no name stored", so a
/// failing backend is retried on the next snapshot.
pub struct CachedNameStore<S> {
    inner: S,
    cache: Mutex<FxHashMap<TagId, Option<String>>>,
}

impl<S: NameStore> CachedNameStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, cache: Mutex::new(FxHashMap::default()) }
    }
}

impl<S: NameStore> NameStore for CachedNameStore<S> {
    fn lookup(&self, tag_id: &TagId) -> Result<Option<String>, StoreError> {
        if let Some(name) = self.cache.lock().get(tag_id) {
            return Ok(name.clone());
        }
        // Backend query runs without the cache lock
        let name = self.inner.lookup(tag_id)?;
        self.cache.lock().insert(tag_id.clone(), name.clone());
        Ok(name)
    }

    fn store(&self, tag_id: &TagId, name: &str) -> Result<(), StoreError> {
        self.inner.store(tag_id, name)?;
        self.cache.lock().insert(tag_id.clone(), Some(name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenStore;

    impl NameStore for BrokenStore {
        fn lookup(&self, _tag_id: &TagId) -> Result<Option<String>, StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }

        fn store(&self, _tag_id: &TagId, _name: &str) -> Result<(), StoreError> {
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }
    }

    #[test]
    fn test_unknown_tag_name() {
        let store = SqliteNameStore::open_in_memory().unwrap();
        assert_eq!(store.get_name(&TagId::from("E2001000FFFF")), UNKNOWN_NAME);
    }

    #[test]
    fn test_set_then_get_name() {
        let store = SqliteNameStore::open_in_memory().unwrap();
        let tag = TagId::from("E20010000001");

        assert!(store.set_name(&tag, "Forklift 3"));
        assert_eq!(store.get_name(&tag), "Forklift 3");

        assert!(store.set_name(&tag, "Forklift 4"));
        assert_eq!(store.get_name(&tag), "Forklift 4");
    }

    #[test]
    fn test_names_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.db");
        let tag = TagId::from("E20010000002");

        {
            let store = SqliteNameStore::open(&path).unwrap();
            assert!(store.set_name(&tag, "Ladder"));
        }

        let store = SqliteNameStore::open(&path).unwrap();
        assert_eq!(store.get_name(&tag), "Ladder");
    }

    #[test]
    fn test_failed_lookup_falls_back_to_id() {
        let tag = TagId::from("E20010000003");
        assert_eq!(BrokenStore.get_name(&tag), "E20010000003");
        assert!(!BrokenStore.set_name(&tag, "Anything"));
    }

    /// Counts backend lookups; fails them while `broken` is set
    struct CountingStore {
        inner: SqliteNameStore,
        lookups: AtomicUsize,
        broken: std::sync::atomic::AtomicBool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: SqliteNameStore::open_in_memory().unwrap(),
                lookups: AtomicUsize::new(0),
                broken: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl NameStore for CountingStore {
        fn lookup(&self, tag_id: &TagId) -> Result<Option<String>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
            }
            self.inner.lookup(tag_id)
        }

        fn store(&self, tag_id: &TagId, name: &str) -> Result<(), StoreError> {
            self.inner.store(tag_id, name)
        }
    }

    #[test]
    fn test_cache_serves_repeat_lookups() {
        let store = CachedNameStore::new(CountingStore::new());
        let named = TagId::from("E20010000010");
        let unnamed = TagId::from("E20010000011");
        assert!(store.inner.store(&named, "Pallet Jack").is_ok());

        for _ in 0..5 {
            assert_eq!(store.get_name(&named), "Pallet Jack");
            assert_eq!(store.get_name(&unnamed), UNKNOWN_NAME);
        }
        assert_eq!(store.inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rename_through_cache_is_visible() {
        let store = CachedNameStore::new(CountingStore::new());
        let tag = TagId::from("E20010000012");

        assert_eq!(store.get_name(&tag), UNKNOWN_NAME);
        assert!(store.set_name(&tag, "Scissor Lift"));
        assert_eq!(store.get_name(&tag), "Scissor Lift");
        assert!(store.set_name(&tag, "Boom Lift"));
        assert_eq!(store.get_name(&tag), "Boom Lift");

        // Only the first lookup reached the backend
        assert_eq!(store.inner.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.lookup(&tag).unwrap().as_deref(), Some("Boom Lift"));
    }

    #[test]
    fn test_cache_skips_failed_lookups() {
        let store = CachedNameStore::new(CountingStore::new());
        let tag = TagId::from("E20010000013");
        assert!(store.inner.store(&tag, "Generator").is_ok());

        store.inner.broken.store(true, Ordering::SeqCst);
        assert_eq!(store.get_name(&tag), "E20010000013");

        store.inner.broken.store(false, Ordering::SeqCst);
        assert_eq!(store.get_name(&tag), "Generator");
        assert_eq!(store.inner.lookups.load(Ordering::SeqCst), 2);
    }
}
