use std::path::Path;

use async_trait::async_trait;
use ovocall_common::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::record_store::RecordStore;

/// SQLite-backed [`RecordStore`]. All tables share one `records` relation keyed by
/// `(tbl, key)`; secondary lookups go through `json_extract`.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening record store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tbl TEXT NOT NULL,
            key TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (tbl, key)
        );

        CREATE INDEX IF NOT EXISTS idx_records_tbl ON records(tbl, seq);",
    )
    .map_err(|e| Error::Database(format!("migration failed: {e}")))
}

/// Bind a JSON scalar the way `json_extract` reports it back.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

fn decode_body(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("skipping undecodable record body: {e}");
        Value::Null
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE tbl = ?1 AND key = ?2",
                params![table, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load record: {e}")))?;
        Ok(body.map(|b| decode_body(&b)))
    }

    async fn put(&self, table: &str, key: &str, record: Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO records (tbl, key, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(tbl, key) DO UPDATE SET
               body = excluded.body,
               updated_at = datetime('now')",
            params![table, key, record.to_string()],
        )
        .map_err(|e| Error::Database(format!("failed to put record: {e}")))?;
        Ok(())
    }

    async fn add(&self, table: &str, record: Value) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO records (tbl, key, body) VALUES (?1, ?2, ?3)",
            params![table, id, record.to_string()],
        )
        .map_err(|e| Error::Database(format!("failed to add record: {e}")))?;
        Ok(id)
    }

    async fn query(&self, table: &str, index: &str, value: &Value) -> Result<Vec<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT body FROM records
                 WHERE tbl = ?1 AND json_extract(body, ?2) = ?3
                 ORDER BY seq",
            )
            .map_err(|e| Error::Database(format!("failed to prepare record query: {e}")))?;

        let rows = stmt
            .query_map(params![table, json_path(index), to_sql_value(value)], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| Error::Database(format!("failed to query records: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let body =
                row.map_err(|e| Error::Database(format!("failed to read record row: {e}")))?;
            records.push(decode_body(&body));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteRecordStore;
    use crate::record_store::{RecordStore, tables};
    use serde_json::json;

    #[tokio::test]
    async fn put_get_and_overwrite() {
        let store = SqliteRecordStore::in_memory().expect("in-memory store should open");
        store
            .put(tables::CONTACTS, "13800000000", json!({"name": "林"}))
            .await
            .expect("put should succeed");
        store
            .put(tables::CONTACTS, "13800000000", json!({"name": "林晚"}))
            .await
            .expect("overwrite should succeed");

        let record = store
            .get(tables::CONTACTS, "13800000000")
            .await
            .expect("get should succeed");
        assert_eq!(record, Some(json!({"name": "林晚"})));
        assert!(
            store
                .get(tables::CHARACTER_NOTES, "13800000000")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn query_by_string_and_bool_fields() {
        let store = SqliteRecordStore::in_memory().unwrap();
        for (session, content, read) in [
            ("sms_13900000000", "first", false),
            ("sms_13700000000", "other", true),
            ("sms_13900000000", "second", true),
        ] {
            store
                .add(
                    tables::CHAT_MESSAGES,
                    json!({"sessionId": session, "content": content, "read": read}),
                )
                .await
                .unwrap();
        }

        let hits = store
            .query(tables::CHAT_MESSAGES, "sessionId", &json!("sms_13900000000"))
            .await
            .unwrap();
        let contents: Vec<_> = hits.iter().map(|r| r["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["first", "second"]);

        let read = store
            .query(tables::CHAT_MESSAGES, "read", &json!(true))
            .await
            .unwrap();
        assert_eq!(read.len(), 2);
    }

    #[tokio::test]
    async fn reopening_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ovocall.db");
        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store
                .put(tables::CHARACTER_STATUS, "char-1", json!({"value": "在加班"}))
                .await
                .unwrap();
        }
        let store = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(
            store.get(tables::CHARACTER_STATUS, "char-1").await.unwrap(),
            Some(json!({"value": "在加班"}))
        );
    }
}
