//! Metadata store — persistent, mutex-guarded field statistics (spec §4.3).
//!
//! The store is the single source of truth for appearance counts, type
//! histograms, samples, and drift; the placement engine consults it and
//! writes decisions back into it. All mutation and derived-read operations
//! go through one `Mutex<StoreInner>` (spec §5) — contention is low (single
//! feeder in the common case) so a lock-free design would trade correctness
//! for no measurable benefit (spec §9).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    DetectedType, FieldRecord, GlobalCounters, NormalizationRule, Placement, PlacementDecision,
    DRIFT_WINDOW, MAX_SAMPLE_LEN, MAX_SAMPLE_VALUES,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read metadata file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse metadata file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist metadata to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-disk shape of the metadata store (spec §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    fields: HashMap<String, FieldRecord>,
    normalization_rules: Vec<NormalizationRule>,
    placement_decisions: HashMap<String, PlacementDecision>,
    counters: GlobalCounters,
}

struct StoreInner {
    fields: HashMap<String, FieldRecord>,
    normalization_rules: HashMap<String, String>,
    placement_decisions: HashMap<String, PlacementDecision>,
    counters: GlobalCounters,
}

impl StoreInner {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            fields: HashMap::new(),
            normalization_rules: HashMap::new(),
            placement_decisions: HashMap::new(),
            counters: GlobalCounters::new(now),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let normalization_rules = snapshot
            .normalization_rules
            .into_iter()
            .map(|rule| (rule.raw, rule.canonical))
            .collect();
        Self {
            fields: snapshot.fields,
            normalization_rules,
            placement_decisions: snapshot.placement_decisions,
            counters: snapshot.counters,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        let normalization_rules = self
            .normalization_rules
            .iter()
            .map(|(raw, canonical)| NormalizationRule {
                raw: raw.clone(),
                canonical: canonical.clone(),
            })
            .collect();
        Snapshot {
            fields: self.fields.clone(),
            normalization_rules,
            placement_decisions: self.placement_decisions.clone(),
            counters: self.counters.clone(),
        }
    }
}

/// Persistent, thread-safe metadata store keyed by canonical field name.
pub struct MetadataStore {
    path: Option<PathBuf>,
    inner: Mutex<StoreInner>,
    checkpoint_every: u64,
    records_since_checkpoint: Mutex<u64>,
}

impl MetadataStore {
    /// Open (or initialize) a store backed by `path`. A missing or corrupt
    /// file logs a warning and falls back to an empty store (spec §4.3,
    /// §7 — "Metadata persistence failure" / load side).
    pub fn open(path: impl AsRef<Path>, checkpoint_every: u64) -> Self {
        let path = path.as_ref().to_path_buf();
        let now = Utc::now();
        let inner = match Self::load(&path) {
            Ok(Some(snapshot)) => StoreInner::from_snapshot(snapshot),
            Ok(None) => StoreInner::empty(now),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to load metadata store, starting fresh");
                StoreInner::empty(now)
            }
        };
        Self {
            path: Some(path),
            inner: Mutex::new(inner),
            checkpoint_every: checkpoint_every.max(1),
            records_since_checkpoint: Mutex::new(0),
        }
    }

    /// An in-memory-only store, useful for tests and for embedding when no
    /// persistence is desired.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(StoreInner::empty(Utc::now())),
            checkpoint_every: u64::MAX,
            records_since_checkpoint: Mutex::new(0),
        }
    }

    fn load(path: &Path) -> Result<Option<Snapshot>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Some(snapshot))
    }

    /// Atomically persist the store: write to a sibling temp file, flush,
    /// then rename over the real path (spec §4.3).
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut inner = self.inner.lock().unwrap();
        inner.counters.last_updated = Utc::now();
        let snapshot = inner.to_snapshot();
        drop(inner);

        let bytes = serde_json::to_vec_pretty(&snapshot).expect("snapshot always serializes");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Increment the global record counter (spec §4.3).
    pub fn increment_total_records(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.total_records += 1;
    }

    /// Update per-field statistics for one observed `(key, tag, value)`
    /// (spec §4.3). Bumps `appearances`, the type histogram, `last_seen`,
    /// inserts into `sample_values` if not already present and below the
    /// bound, and pushes onto the drift ring buffer.
    pub fn update_field_stats(&self, canonical_key: &str, tag: DetectedType, value: &serde_json::Value) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .fields
            .entry(canonical_key.to_string())
            .or_insert_with(|| FieldRecord::new(now));

        record.appearances += 1;
        record.last_seen = now;
        *record.type_counts.entry(tag.as_str().to_string()).or_insert(0) += 1;
        if tag == DetectedType::Null {
            record.null_count += 1;
        }

        if record.sample_values.len() < MAX_SAMPLE_VALUES {
            let rendered = render_sample(value);
            if !record.sample_values.contains(&rendered) {
                record.sample_values.push(rendered);
            }
        }

        if record.recent_tags.len() == DRIFT_WINDOW {
            record.recent_tags.pop_front();
        }
        record.recent_tags.push_back(tag);
    }

    /// Idempotent insert of a `raw -> canonical` mapping (spec §4.3, §4.6).
    pub fn add_normalization_rule(&self, raw: &str, canonical: &str) {
        if raw == canonical {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .normalization_rules
            .entry(raw.to_string())
            .or_insert_with(|| canonical.to_string());
    }

    /// Last-writer-wins placement decision persistence (spec §4.3).
    pub fn set_placement_decision(&self, canonical_key: &str, backend: Placement, reason: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.placement_decisions.insert(
            canonical_key.to_string(),
            PlacementDecision {
                backend,
                reason,
                decided_at: Utc::now(),
            },
        );
        if let Some(field) = inner.fields.get_mut(canonical_key) {
            field.placement = backend;
        }
    }

    /// Mark a field quarantined after severe drift (spec §4.3, §4.4).
    pub fn mark_quarantined(&self, canonical_key: &str, _drift_score: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(field) = inner.fields.get_mut(canonical_key) {
            field.quarantined = true;
        }
    }

    pub fn get_placement_decision(&self, canonical_key: &str) -> Option<PlacementDecision> {
        let inner = self.inner.lock().unwrap();
        inner.placement_decisions.get(canonical_key).cloned()
    }

    /// `appearances(k) / max(total_records, 1)` (spec §4.3).
    pub fn frequency(&self, canonical_key: &str) -> f64 {
        let inner = self.inner.lock().unwrap();
        let total = inner.counters.total_records.max(1);
        inner
            .fields
            .get(canonical_key)
            .map(|f| f.appearances as f64 / total as f64)
            .unwrap_or(0.0)
    }

    pub fn field_snapshot(&self, canonical_key: &str) -> Option<FieldRecord> {
        let inner = self.inner.lock().unwrap();
        inner.fields.get(canonical_key).cloned()
    }

    pub fn all_keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.fields.keys().cloned().collect()
    }

    pub fn total_records(&self) -> u64 {
        self.inner.lock().unwrap().counters.total_records
    }

    pub fn global_counters(&self) -> GlobalCounters {
        self.inner.lock().unwrap().counters.clone()
    }

    pub fn field_count(&self) -> usize {
        self.inner.lock().unwrap().fields.len()
    }

    pub fn normalization_rule_count(&self) -> usize {
        self.inner.lock().unwrap().normalization_rules.len()
    }

    pub fn placement_decision_count(&self) -> usize {
        self.inner.lock().unwrap().placement_decisions.len()
    }

    /// Record one more processed record and, if the checkpoint cadence has
    /// been reached, persist to disk (spec §4.3, §4.6 step 7). Returns
    /// whether a checkpoint happened, for callers that want to log it.
    pub fn maybe_checkpoint(&self) -> bool {
        let mut count = self.records_since_checkpoint.lock().unwrap();
        *count += 1;
        if *count >= self.checkpoint_every {
            *count = 0;
            drop(count);
            if let Err(err) = self.save() {
                tracing::warn!(error = %err, "metadata checkpoint failed, in-memory state remains authoritative");
            }
            true
        } else {
            false
        }
    }
}

fn render_sample(value: &serde_json::Value) -> String {
    let rendered = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() > MAX_SAMPLE_LEN {
        rendered.chars().take(MAX_SAMPLE_LEN).collect()
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn update_field_stats_keeps_type_counts_summing_to_appearances() {
        let store = MetadataStore::in_memory();
        store.update_field_stats("battery", DetectedType::Integer, &json!(50));
        store.update_field_stats("battery", DetectedType::Integer, &json!(60));
        store.update_field_stats("battery", DetectedType::String, &json!("charging"));

        let field = store.field_snapshot("battery").unwrap();
        let sum: u64 = field.type_counts.values().sum();
        assert_eq!(sum, field.appearances);
        assert_eq!(field.appearances, 3);
    }

    #[test]
    fn sample_values_are_bounded_truncated_and_deduplicated() {
        let store = MetadataStore::in_memory();
        for i in 0..10 {
            store.update_field_stats("name", DetectedType::String, &json!(format!("user-{i}")));
        }
        // Duplicate of an already-inserted sample must not grow the list.
        store.update_field_stats("name", DetectedType::String, &json!("user-0"));

        let field = store.field_snapshot("name").unwrap();
        assert!(field.sample_values.len() <= 5);
        assert_eq!(field.appearances, 11);

        let long_value = "x".repeat(500);
        let store2 = MetadataStore::in_memory();
        store2.update_field_stats("blob", DetectedType::String, &json!(long_value));
        let field2 = store2.field_snapshot("blob").unwrap();
        assert_eq!(field2.sample_values[0].chars().count(), 100);
    }

    #[test]
    fn persist_then_load_round_trips_ignoring_last_updated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let store = MetadataStore::open(&path, 10);
        store.update_field_stats("email", DetectedType::Email, &json!("a@b.com"));
        store.increment_total_records();
        store.add_normalization_rule("Email", "email");
        store.set_placement_decision("email", Placement::Sql, "test".to_string());
        store.save().unwrap();

        let reloaded = MetadataStore::open(&path, 10);
        assert_eq!(reloaded.total_records(), 1);
        assert_eq!(reloaded.field_count(), 1);
        assert_eq!(reloaded.normalization_rule_count(), 1);
        let decision = reloaded.get_placement_decision("email").unwrap();
        assert_eq!(decision.backend, Placement::Sql);

        let original_field = store.field_snapshot("email").unwrap();
        let reloaded_field = reloaded.field_snapshot("email").unwrap();
        pretty_assertions::assert_eq!(original_field.appearances, reloaded_field.appearances);
        pretty_assertions::assert_eq!(original_field.type_counts, reloaded_field.type_counts);
    }

    #[test]
    fn load_failure_on_corrupt_file_falls_back_to_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = MetadataStore::open(&path, 10);
        assert_eq!(store.total_records(), 0);
        assert_eq!(store.field_count(), 0);
    }

    #[test]
    fn checkpoint_fires_at_configured_cadence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let store = MetadataStore::open(&path, 3);

        assert!(!store.maybe_checkpoint());
        assert!(!store.maybe_checkpoint());
        assert!(store.maybe_checkpoint());
        assert!(path.exists());
    }
}
