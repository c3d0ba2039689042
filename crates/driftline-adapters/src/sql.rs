//! SQLite-backed relational adapter with dynamic schema evolution (spec
//! §4.7, §6.3). Grounded on the original implementation's `SQLManager`
//! (schema bootstrap, `PRAGMA table_info` + `ALTER TABLE` evolution,
//! best-effort unique index creation), expressed with `rusqlite` instead of
//! Python's `sqlite3` module.

use std::sync::Mutex;

use driftline_core::adapter::BackendAdapter;
use driftline_core::detect::sql_column_type;
use driftline_core::pipeline::PendingColumn;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};

const TABLE: &str = "ingested_records";

#[derive(Debug, thiserror::Error)]
pub enum SqlAdapterError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Relational backend: one evolving table with mandatory columns plus
/// whatever fields get promoted to SQL placement.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    pub fn open(db_path: impl AsRef<std::path::Path>) -> Result<Self, SqlAdapterError> {
        let conn = Connection::open(db_path)?;
        let adapter = Self {
            conn: Mutex::new(conn),
        };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn in_memory() -> Result<Self, SqlAdapterError> {
        let conn = Connection::open_in_memory()?;
        let adapter = Self {
            conn: Mutex::new(conn),
        };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    fn initialize_schema(&self) -> Result<(), SqlAdapterError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                sys_ingested_at TIMESTAMP NOT NULL,
                t_stamp TEXT,
                UNIQUE(sys_ingested_at)
            )"
        ))?;
        Ok(())
    }

    fn existing_columns(&self, conn: &Connection) -> Result<Vec<String>, SqlAdapterError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({TABLE})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }
}

impl BackendAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        "sql"
    }

    fn ensure_column(&self, column: &PendingColumn) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let existing = self.existing_columns(&conn)?;
        if existing.iter().any(|c| c == &column.canonical_key) {
            return Ok(());
        }

        let sql_type = sql_column_type(column.detected_type);
        conn.execute_batch(&format!(
            "ALTER TABLE {TABLE} ADD COLUMN {} {sql_type}",
            column.canonical_key
        ))?;
        tracing::info!(column = %column.canonical_key, sql_type, "added column");

        if column.unique && !matches!(column.canonical_key.as_str(), "username" | "t_stamp") {
            let index_name = format!("idx_{}", column.canonical_key);
            let result = conn.execute_batch(&format!(
                "CREATE UNIQUE INDEX {index_name} ON {TABLE}({})",
                column.canonical_key
            ));
            match result {
                Ok(()) => tracing::info!(column = %column.canonical_key, "added unique index"),
                Err(err) => tracing::warn!(
                    column = %column.canonical_key,
                    error = %err,
                    "could not add unique constraint, duplicate values likely exist"
                ),
            }
        }
        Ok(())
    }

    fn insert(&self, record: &Map<String, Value>) -> anyhow::Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        let columns: Vec<&String> = record.keys().collect();
        let placeholders: Vec<String> = (0..columns.len()).map(|_| "?".to_string()).collect();
        let values: Vec<rusqlite::types::Value> =
            columns.iter().map(|k| json_to_sql(&record[*k])).collect();

        let query = format!(
            "INSERT INTO {TABLE} ({}) VALUES ({})",
            columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn.lock().unwrap();
        conn.execute(&query, params_from_iter(values))?;
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Arrays/objects should already have been JSON-stringified upstream
        // by the pipeline's SQL projection; this is a defensive fallback.
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::types::DetectedType;
    use serde_json::json;

    fn pending(key: &str, tag: DetectedType, unique: bool) -> PendingColumn {
        PendingColumn {
            canonical_key: key.to_string(),
            detected_type: tag,
            unique,
        }
    }

    #[test]
    fn schema_bootstrap_creates_mandatory_columns() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let conn = adapter.conn.lock().unwrap();
        let columns = adapter.existing_columns(&conn).unwrap();
        assert!(columns.contains(&"username".to_string()));
        assert!(columns.contains(&"sys_ingested_at".to_string()));
        assert!(columns.contains(&"t_stamp".to_string()));
    }

    #[test]
    fn ensure_column_adds_new_column_exactly_once() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .ensure_column(&pending("email", DetectedType::Email, false))
            .unwrap();
        adapter
            .ensure_column(&pending("email", DetectedType::Email, false))
            .unwrap();

        let conn = adapter.conn.lock().unwrap();
        let columns = adapter.existing_columns(&conn).unwrap();
        let matches = columns.iter().filter(|c| *c == "email").count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn insert_and_count_round_trip() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .ensure_column(&pending("email", DetectedType::Email, false))
            .unwrap();

        let mut record = Map::new();
        record.insert("username".to_string(), json!("alice"));
        record.insert("sys_ingested_at".to_string(), json!("2026-01-01T00:00:00.000000"));
        record.insert("t_stamp".to_string(), json!("2026-01-01T00:00:00Z"));
        record.insert("email".to_string(), json!("alice@example.com"));
        adapter.insert(&record).unwrap();

        let conn = adapter.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn duplicate_sys_ingested_at_is_rejected_by_unique_constraint() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let mut record = Map::new();
        record.insert("username".to_string(), json!("alice"));
        record.insert("sys_ingested_at".to_string(), json!("same-ts"));
        adapter.insert(&record).unwrap();

        let mut duplicate = Map::new();
        duplicate.insert("username".to_string(), json!("bob"));
        duplicate.insert("sys_ingested_at".to_string(), json!("same-ts"));
        assert!(adapter.insert(&duplicate).is_err());
    }
}
