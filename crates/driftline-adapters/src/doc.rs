//! JSON-file-backed document adapter (spec §4.7, §6.3).
//!
//! Schema-less by nature — `ensure_column` is a no-op. Records are appended
//! to a JSON-lines file under `data_dir`, one record per line, with an
//! in-memory unique index on `sys_ingested_at` (mirroring the original
//! implementation's MongoDB unique index) rebuilt from disk on open and a
//! secondary (non-unique) index on `username`.
//!
//! A real MongoDB deployment is out of scope (spec's non-goals explicitly
//! exclude concrete storage engines beyond the adapter contract); this
//! gives the document side of the pipeline somewhere durable to land
//! without pulling in a full async driver for a single-writer file store.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use driftline_core::adapter::BackendAdapter;
use driftline_core::pipeline::PendingColumn;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum DocAdapterError {
    #[error("duplicate sys_ingested_at: {0}")]
    DuplicateKey(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct Index {
    seen_sys_ingested_at: HashSet<String>,
    by_username: HashMap<String, Vec<u64>>,
    line_count: u64,
}

pub struct DocumentAdapter {
    records_path: PathBuf,
    writer: Mutex<File>,
    index: Mutex<Index>,
}

impl DocumentAdapter {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, DocAdapterError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).map_err(|source| DocAdapterError::Io {
            path: data_dir.clone(),
            source,
        })?;
        let records_path = data_dir.join("records.jsonl");

        let index = Self::rebuild_index(&records_path)?;

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&records_path)
            .map_err(|source| DocAdapterError::Io {
                path: records_path.clone(),
                source,
            })?;

        Ok(Self {
            records_path,
            writer: Mutex::new(writer),
            index: Mutex::new(index),
        })
    }

    fn rebuild_index(records_path: &Path) -> Result<Index, DocAdapterError> {
        let mut index = Index {
            seen_sys_ingested_at: HashSet::new(),
            by_username: HashMap::new(),
            line_count: 0,
        };
        if !records_path.exists() {
            return Ok(index);
        }

        let file = File::open(records_path).map_err(|source| DocAdapterError::Io {
            path: records_path.to_path_buf(),
            source,
        })?;
        for (offset, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| DocAdapterError::Io {
                path: records_path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<Map<String, Value>>(&line) else {
                tracing::warn!(path = %records_path.display(), "skipping corrupt document record on reload");
                continue;
            };
            if let Some(Value::String(ts)) = record.get("sys_ingested_at") {
                index.seen_sys_ingested_at.insert(ts.clone());
            }
            if let Some(Value::String(username)) = record.get("username") {
                index
                    .by_username
                    .entry(username.clone())
                    .or_default()
                    .push(offset as u64);
            }
            index.line_count += 1;
        }
        Ok(index)
    }

    pub fn record_count(&self) -> usize {
        self.index.lock().unwrap().seen_sys_ingested_at.len()
    }

    pub fn records_path(&self) -> &Path {
        &self.records_path
    }
}

impl BackendAdapter for DocumentAdapter {
    fn name(&self) -> &str {
        "doc"
    }

    /// Document backend is schema-less; nothing to evolve.
    fn ensure_column(&self, _column: &PendingColumn) -> anyhow::Result<()> {
        Ok(())
    }

    fn insert(&self, record: &Map<String, Value>) -> anyhow::Result<()> {
        let sys_ingested_at = record
            .get("sys_ingested_at")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut index = self.index.lock().unwrap();
        if let Some(ts) = &sys_ingested_at {
            if index.seen_sys_ingested_at.contains(ts) {
                return Err(DocAdapterError::DuplicateKey(ts.clone()).into());
            }
        }

        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{line}").map_err(|source| DocAdapterError::Io {
            path: self.records_path.clone(),
            source,
        })?;
        writer.flush().map_err(|source| DocAdapterError::Io {
            path: self.records_path.clone(),
            source,
        })?;

        if let Some(ts) = sys_ingested_at {
            index.seen_sys_ingested_at.insert(ts);
        }
        let offset = index.line_count;
        if let Some(Value::String(username)) = record.get("username") {
            index.by_username.entry(username.clone()).or_default().push(offset);
        }
        index.line_count += 1;
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.writer.lock().unwrap().flush()?;
        Ok(())
    }
}
