//! Local structured store of per-entity progress.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::json::{load_or_default, save_atomic};
use super::StoreResult;
use crate::sync::{EntityKey, LocalRecord};

/// Progress records with sync-pending flags.
pub trait LocalStore: Send + Sync {
    /// Look up one record.
    fn get(&self, key: &EntityKey) -> StoreResult<Option<LocalRecord>>;

    /// Insert or replace a record.
    fn upsert(&self, record: LocalRecord) -> StoreResult<()>;

    /// Every record, ordered by key.
    fn all(&self) -> StoreResult<Vec<LocalRecord>>;

    /// Records edited locally and not yet pushed.
    fn pending(&self) -> StoreResult<Vec<LocalRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|record| record.pending_sync)
            .collect())
    }

    /// Whether anything is waiting to be pushed.
    fn has_pending(&self) -> StoreResult<bool> {
        Ok(!self.pending()?.is_empty())
    }
}

type RecordMap = BTreeMap<String, LocalRecord>;

fn insert(records: &mut RecordMap, record: LocalRecord) {
    records.insert(record.key.to_string(), record);
}

/// Store kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<RecordMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = LocalRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock();
            for record in records {
                insert(&mut map, record);
            }
        }
        store
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &EntityKey) -> StoreResult<Option<LocalRecord>> {
        Ok(self.records.lock().get(&key.to_string()).cloned())
    }

    fn upsert(&self, record: LocalRecord) -> StoreResult<()> {
        insert(&mut self.records.lock(), record);
        Ok(())
    }

    fn all(&self) -> StoreResult<Vec<LocalRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// Store persisted as a JSON object keyed by `<type>:<id>`.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<RecordMap>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating it on first write.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let records = load_or_default(&path)?;
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalStore for JsonFileStore {
    fn get(&self, key: &EntityKey) -> StoreResult<Option<LocalRecord>> {
        Ok(self.records.lock().get(&key.to_string()).cloned())
    }

    fn upsert(&self, record: LocalRecord) -> StoreResult<()> {
        let mut records = self.records.lock();
        insert(&mut records, record);
        save_atomic(&self.path, &*records)
    }

    fn all(&self) -> StoreResult<Vec<LocalRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
