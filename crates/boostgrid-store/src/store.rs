//! StateStore — redb-backed coordination store for BoostGrid.
//!
//! Provides key/value entries with time-to-live, string sets, bounded
//! lists, and named publish/subscribe channels. The store supports both
//! on-disk and in-memory backends (the latter for testing).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use boostgrid_core::time::{epoch_millis, millis};

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: serde_json::Value,
    /// Epoch milliseconds after which the entry reads as absent.
    expires_at: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>>;

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    channels: Channels,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(SETS).map_err(map_err!(Table))?;
        txn.open_table(LISTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Entries ────────────────────────────────────────────────────

    /// Insert or replace a value. `ttl = None` keeps it until deleted.
    pub fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> StoreResult<()> {
        let entry = StoredEntry {
            value: serde_json::to_value(value).map_err(map_err!(Encode))?,
            expires_at: ttl.map(|ttl| epoch_millis().saturating_add(millis(ttl))),
        };
        let bytes = serde_json::to_vec(&entry).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ttl_ms = ttl.map(millis), "entry stored");
        Ok(())
    }

    /// Read a value. Missing and expired entries both return `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let Some(guard) = table.get(key).map_err(map_err!(Storage))? else {
            return Ok(None);
        };
        let entry: StoredEntry =
            serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
        if entry.is_expired(epoch_millis()) {
            return Ok(None);
        }
        let value = serde_json::from_value(entry.value).map_err(map_err!(Decode))?;
        Ok(Some(value))
    }

    /// Delete an entry. Returns true if it existed.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> StoreResult<u32> {
        let now = epoch_millis();
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for item in table.iter().map_err(map_err!(Storage))? {
                let (key, value) = item.map_err(map_err!(Storage))?;
                let entry: StoredEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
                if entry.is_expired(now) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(purged = keys.len(), "expired entries purged");
        Ok(keys.len() as u32)
    }

    // ── Sets ───────────────────────────────────────────────────────

    /// Add a member. Returns true if it was not already present.
    pub fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.update_set(key, |set| set.insert(member.to_string()))
    }

    /// Remove a member. Returns true if it was present.
    pub fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.update_set(key, |set| set.remove(member))
    }

    /// Replace the whole set in one transaction.
    pub fn set_replace<I, S>(&self, key: &str, members: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        self.update_set(key, |set| {
            *set = members;
            true
        })?;
        Ok(())
    }

    /// All members in sorted order.
    pub fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Storage))? {
            Some(guard) => {
                let set: BTreeSet<String> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(set.into_iter().collect())
            }
            None => Ok(Vec::new()),
        }
    }

    fn update_set<F>(&self, key: &str, f: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let changed;
        {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let existing = table
                .get(key)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value().to_vec());
            let mut set: BTreeSet<String> = match existing {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Decode))?,
                None => BTreeSet::new(),
            };
            changed = f(&mut set);
            let bytes = serde_json::to_vec(&set).map_err(map_err!(Encode))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(changed)
    }

    // ── Lists ──────────────────────────────────────────────────────

    /// Push a value to the head of a list and trim it to `max_len` entries.
    ///
    /// Returns the list length after trimming.
    pub fn list_push_bounded<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        max_len: usize,
    ) -> StoreResult<usize> {
        let value = serde_json::to_value(value).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let len;
        {
            let mut table = txn.open_table(LISTS).map_err(map_err!(Table))?;
            let existing = table
                .get(key)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value().to_vec());
            let mut list: Vec<serde_json::Value> = match existing {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Decode))?,
                None => Vec::new(),
            };
            list.insert(0, value);
            list.truncate(max_len);
            len = list.len();
            let bytes = serde_json::to_vec(&list).map_err(map_err!(Encode))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(len)
    }

    /// Up to `limit` values from the head of a list (newest first).
    pub fn list_range<T: DeserializeOwned>(&self, key: &str, limit: usize) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LISTS).map_err(map_err!(Table))?;
        let Some(guard) = table.get(key).map_err(map_err!(Storage))? else {
            return Ok(Vec::new());
        };
        let list: Vec<serde_json::Value> =
            serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
        list.into_iter()
            .take(limit)
            .map(|v| serde_json::from_value(v).map_err(map_err!(Decode)))
            .collect()
    }

    // ── Publish / subscribe ────────────────────────────────────────

    /// Publish a message on a channel. Returns the number of subscribers reached.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish<T: Serialize>(&self, channel: &str, message: &T) -> StoreResult<usize> {
        let value = serde_json::to_value(message).map_err(map_err!(Encode))?;
        Ok(self.sender(channel).send(value).unwrap_or(0))
    }

    /// Subscribe to a channel. Messages published before this call are not seen.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        self.sender(channel).subscribe()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<serde_json::Value> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn put_and_get_roundtrip() {
        let store = test_store();
        let sample = Sample {
            name: "pool".into(),
            count: 3,
        };
        store.put("boostgrid:sample", &sample, None).unwrap();
        let back: Option<Sample> = store.get("boostgrid:sample").unwrap();
        assert_eq!(back, Some(sample));
    }

    #[test]
    fn get_missing_returns_none() {
        let store = test_store();
        let value: Option<Sample> = store.get("nope").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn expired_entries_read_as_absent_and_purge() {
        let store = test_store();
        store.put("short", &1u32, Some(Duration::ZERO)).unwrap();
        store.put("long", &2u32, Some(Duration::from_secs(3600))).unwrap();
        store.put("forever", &3u32, None).unwrap();

        assert_eq!(store.get::<u32>("short").unwrap(), None);
        assert_eq!(store.get::<u32>("long").unwrap(), Some(2));
        assert_eq!(store.get::<u32>("forever").unwrap(), Some(3));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(!store.delete("short").unwrap());
    }

    #[test]
    fn delete_reports_existence() {
        let store = test_store();
        store.put("k", &"v", None).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn set_operations() {
        let store = test_store();
        assert!(store.set_add("ids", "b").unwrap());
        assert!(store.set_add("ids", "a").unwrap());
        assert!(!store.set_add("ids", "a").unwrap());
        assert_eq!(store.set_members("ids").unwrap(), vec!["a", "b"]);

        assert!(store.set_remove("ids", "a").unwrap());
        assert!(!store.set_remove("ids", "a").unwrap());

        store.set_replace("ids", ["x", "y"]).unwrap();
        assert_eq!(store.set_members("ids").unwrap(), vec!["x", "y"]);
        assert!(store.set_members("other").unwrap().is_empty());
    }

    #[test]
    fn bounded_list_keeps_newest() {
        let store = test_store();
        for i in 0..5u32 {
            store.list_push_bounded("history", &i, 3).unwrap();
        }
        let items: Vec<u32> = store.list_range("history", 10).unwrap();
        assert_eq!(items, vec![4, 3, 2]);

        let head: Vec<u32> = store.list_range("history", 1).unwrap();
        assert_eq!(head, vec![4]);
        assert!(store.list_range::<u32>("empty", 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_in_order() {
        let store = test_store();
        let mut rx = store.subscribe("events");

        for i in 0..3u32 {
            assert_eq!(store.publish("events", &i).unwrap(), 1);
        }
        for i in 0..3u32 {
            assert_eq!(rx.recv().await.unwrap(), serde_json::json!(i));
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let store = test_store();
        assert_eq!(store.publish("quiet", &"hello").unwrap(), 0);
    }

    #[tokio::test]
    async fn clones_share_channels() {
        let store = test_store();
        let other = store.clone();
        let mut rx = store.subscribe("shared");
        other.publish("shared", &"ping").unwrap();
        assert_eq!(rx.recv().await.unwrap(), serde_json::json!("ping"));
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boostgrid.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put("persisted", &42u32, None).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get::<u32>("persisted").unwrap(), Some(42));
    }
}
