use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use ovocall_common::Result;
use serde_json::Value;

/// Table names used by the turn core.
pub mod tables {
    /// Keyed by phone number. Holds `strangerPersona` for saved strangers.
    pub const CONTACTS: &str = "contacts";
    pub const CHARACTER_NOTES: &str = "characterNotes";
    pub const CHARACTER_STATUS: &str = "characterStatus";
    /// Interference SMS logs, indexed by `sessionId`.
    pub const CHAT_MESSAGES: &str = "chatMessages";
    pub const FRIEND_REQUESTS: &str = "friendRequests";
}

/// Key-value persistence over opaque JSON records.
///
/// Every write the turn core performs through this trait is best effort: callers log
/// failures and carry on.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;

    /// Insert or replace the record stored under `key`.
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<()>;

    /// Insert a record under a generated key and return that key.
    async fn add(&self, table: &str, record: Value) -> Result<String>;

    /// Records whose top-level `index` field equals `value`, in insertion order.
    async fn query(&self, table: &str, index: &str, value: &Value) -> Result<Vec<Value>>;
}

/// In-process store. Each table keeps insertion order; `put` on an existing key
/// replaces the record in place.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<String, Vec<(String, Value)>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of a table, in insertion order.
    pub fn records(&self, table: &str) -> Vec<Value> {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|rows| rows.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone()))
    }

    async fn put(&self, table: &str, key: &str, record: Value) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = record,
            None => rows.push((key.to_string(), record)),
        }
        Ok(())
    }

    async fn add(&self, table: &str, record: Value) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.tables
            .write()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push((id.clone(), record));
        Ok(id)
    }

    async fn query(&self, table: &str, index: &str, value: &Value) -> Result<Vec<Value>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, v)| v.get(index) == Some(value))
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
