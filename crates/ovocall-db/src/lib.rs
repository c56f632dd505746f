pub mod record_store;
pub mod sqlite_store;

pub use record_store::{MemoryRecordStore, RecordStore, tables};
pub use sqlite_store::SqliteRecordStore;
