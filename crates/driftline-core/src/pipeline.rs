//! Pipeline orchestrator — flattens, normalizes, detects, timestamps, splits,
//! and dispatches one record at a time (spec §4.6).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::detect::detect_type;
use crate::normalize::normalize_key;
use crate::placement::{PlacementConfig, PlacementEngine};
use crate::store::MetadataStore;
use crate::types::Placement;

/// The two backend-specific projections of one ingested record.
#[derive(Debug, Clone, Default)]
pub struct SplitRecord {
    pub sql_record: Map<String, Value>,
    pub doc_record: Map<String, Value>,
}

/// A field that needs a column created before (or as part of) insertion,
/// surfaced so the caller's SQL adapter can evolve its schema (spec §4.6
/// step 5, §4.7).
#[derive(Debug, Clone)]
pub struct PendingColumn {
    pub canonical_key: String,
    pub detected_type: crate::types::DetectedType,
    pub unique: bool,
}

/// Result of running one record through the pipeline.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub split: SplitRecord,
    pub pending_columns: Vec<PendingColumn>,
    pub checkpointed: bool,
}

/// Orchestrates flatten → normalize → detect → timestamp → split for each
/// incoming record. Does not itself talk to backends — see
/// `driftline-adapters` and the `BackendAdapter` trait for that; this type
/// only produces the two projections and the column-evolution hints a
/// relational adapter needs.
pub struct Pipeline {
    store: MetadataStore,
    processed: AtomicU64,
    feeder_id: u32,
    placement_config: PlacementConfig,
}

impl Pipeline {
    pub fn new(store: MetadataStore, feeder_id: u32) -> Self {
        Self::with_placement_config(store, feeder_id, PlacementConfig::default())
    }

    /// Build a pipeline whose placement engine is tuned from `[placement]`
    /// config rather than the built-in defaults (spec §6.4).
    pub fn with_placement_config(store: MetadataStore, feeder_id: u32, placement_config: PlacementConfig) -> Self {
        Self {
            store,
            processed: AtomicU64::new(0),
            feeder_id,
            placement_config,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Run one record through the full pipeline (spec §4.6 steps 1-7,
    /// excluding backend dispatch itself, step 6, which the caller performs
    /// against whichever adapters it has configured).
    pub fn ingest_record(&self, raw_record: &Map<String, Value>) -> IngestOutcome {
        let flat = flatten(raw_record, "");
        let normalized_flat = normalize_flat(&flat, &self.store);
        let normalized_top_level = crate::normalize::normalize_record(raw_record);

        for (canonical_key, value) in &normalized_flat {
            let tag = detect_type(value);
            self.store.update_field_stats(canonical_key, tag, value);
        }

        self.store.increment_total_records();

        let sequence = self.processed.fetch_add(1, Ordering::SeqCst);
        let timestamps = self.bi_temporal_timestamps(&normalized_top_level, sequence);

        let engine = PlacementEngine::with_config(&self.store, self.placement_config.clone());
        let split = self.split_by_placement(&normalized_flat, &normalized_top_level, &timestamps, &engine);
        let pending_columns = self.pending_columns(&split.sql_record, &engine);

        let checkpointed = self.store.maybe_checkpoint();

        if sequence > 0 && sequence % 50 == 0 {
            tracing::info!(processed = sequence, "pipeline progress");
        }

        IngestOutcome {
            split,
            pending_columns,
            checkpointed,
        }
    }

    /// Server timestamp (unique per process) plus client timestamp
    /// passthrough/fallback (spec §4.6 step 4).
    fn bi_temporal_timestamps(
        &self,
        normalized_top_level: &Map<String, Value>,
        sequence: u64,
    ) -> Map<String, Value> {
        let mut out = Map::new();

        let now = Utc::now();
        let sys_ingested_at = format!(
            "{}.{:02}{:06}",
            now.format("%Y-%m-%dT%H:%M:%S"),
            self.feeder_id % 100,
            sequence % 1_000_000,
        );
        out.insert("sys_ingested_at".to_string(), Value::String(sys_ingested_at));

        let t_stamp = normalized_top_level
            .get("t_stamp")
            .or_else(|| normalized_top_level.get("timestamp"))
            .cloned()
            .unwrap_or_else(|| Value::String(now.to_rfc3339()));
        out.insert("t_stamp".to_string(), t_stamp);

        out
    }

    /// Split a record into its SQL and document projections (spec §4.6 step
    /// 5). `BOTH`-placed list/dict values are JSON-serialized for the SQL
    /// side and kept native for the document side; mandatory fields are
    /// forced into both regardless of their own field-level placement.
    fn split_by_placement(
        &self,
        normalized_flat: &Map<String, Value>,
        normalized_top_level: &Map<String, Value>,
        timestamps: &Map<String, Value>,
        engine: &PlacementEngine,
    ) -> SplitRecord {
        let mut split = SplitRecord::default();

        for (key, value) in normalized_flat {
            let placement = engine.decide_placement(key);
            place_value(&mut split, key, value, placement);
        }

        // Nested top-level subtrees are delivered natively to the document
        // side only; they never contribute a flat leaf of their own type
        // (their descendants already did, via `normalized_flat`).
        for (key, value) in normalized_top_level {
            if matches!(value, Value::Object(_)) {
                split.doc_record.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in timestamps {
            let placement = engine.decide_placement(key);
            place_value(&mut split, key, value, placement);
        }

        for mandatory in ["username", "sys_ingested_at", "t_stamp"] {
            if let Some(value) = normalized_flat
                .get(mandatory)
                .or_else(|| timestamps.get(mandatory))
            {
                split.sql_record.entry(mandatory.to_string()).or_insert_with(|| value.clone());
                split.doc_record.entry(mandatory.to_string()).or_insert_with(|| value.clone());
            }
        }

        split
    }

    fn pending_columns(&self, sql_record: &Map<String, Value>, engine: &PlacementEngine) -> Vec<PendingColumn> {
        sql_record
            .iter()
            .map(|(key, value)| PendingColumn {
                canonical_key: key.clone(),
                detected_type: detect_type_for_column(key, value),
                unique: engine.should_be_unique(key),
            })
            .collect()
    }
}

fn detect_type_for_column(_key: &str, value: &Value) -> crate::types::DetectedType {
    match value {
        // BOTH-placed nested values arrive JSON-serialized as strings on the
        // SQL side; the column type should still reflect the original shape
        // where we can recover it cheaply, otherwise fall back to String.
        Value::String(s) if looks_like_json_container(s) => crate::types::DetectedType::String,
        other => detect_type(other),
    }
}

fn looks_like_json_container(s: &str) -> bool {
    let trimmed = s.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

fn place_value(split: &mut SplitRecord, key: &str, value: &Value, placement: Placement) {
    match placement {
        Placement::Sql => {
            split.sql_record.insert(key.to_string(), sql_projection(value));
        }
        Placement::Doc => {
            split.doc_record.insert(key.to_string(), value.clone());
        }
        Placement::Both => {
            split.sql_record.insert(key.to_string(), sql_projection(value));
            split.doc_record.insert(key.to_string(), value.clone());
        }
        Placement::Undecided => {
            split.doc_record.insert(key.to_string(), value.clone());
        }
    }
}

/// List/dict values are JSON-serialized for the relational side (spec §4.6
/// step 5); scalars pass through unchanged.
fn sql_projection(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => {
            Value::String(serde_json::to_string(value).expect("json values always serialize"))
        }
        other => other.clone(),
    }
}

/// Flatten nested structures into dotted/underscored leaf paths. Arrays are
/// leaves, never flattened (spec §4.6 step 1).
fn flatten(record: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in record {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        match value {
            Value::Object(nested) => {
                out.extend(flatten(nested, &path));
            }
            other => {
                out.insert(path, other.clone());
            }
        }
    }
    out
}

/// Normalize every key in an already-flattened map, recording a
/// normalization rule in the store whenever the raw form differs from the
/// canonical one (spec §4.6 step 2).
fn normalize_flat(flat: &Map<String, Value>, store: &MetadataStore) -> Map<String, Value> {
    let mut out = Map::with_capacity(flat.len());
    for (raw_key, value) in flat {
        let canonical = normalize_key(raw_key);
        store.add_normalization_rule(raw_key, &canonical);
        out.insert(canonical, value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> Pipeline {
        Pipeline::new(MetadataStore::in_memory(), 1)
    }

    #[test]
    fn flatten_produces_dotted_leaf_paths_and_leaves_arrays_alone() {
        let record = json!({
            "username": "u",
            "metadata": {
                "sensor": {
                    "version": "2.1"
                }
            },
            "tags": ["a", "b"]
        });
        let flat = flatten(record.as_object().unwrap(), "");
        assert_eq!(flat.get("metadata_sensor_version").unwrap(), "2.1");
        assert_eq!(flat.get("tags").unwrap(), &json!(["a", "b"]));
        assert!(!flat.contains_key("metadata"));
    }

    #[test]
    fn nested_record_delivers_flat_leaf_to_store_and_nested_subtree_to_doc_only() {
        let pipeline = pipeline();
        for _ in 0..12 {
            let record = json!({
                "username": "u",
                "metadata": {"sensor": {"version": "2.1"}}
            });
            pipeline.ingest_record(record.as_object().unwrap());
        }

        let last = pipeline.ingest_record(
            json!({"username": "u", "metadata": {"sensor": {"version": "2.1"}}})
                .as_object()
                .unwrap(),
        );

        assert!(last.split.doc_record.contains_key("metadata"));
        assert!(!last.split.sql_record.contains_key("metadata"));
        assert!(pipeline
            .store()
            .field_snapshot("metadata_sensor_version")
            .is_some());
    }

    #[test]
    fn mandatory_fields_land_in_both_sides_even_under_drift() {
        let pipeline = pipeline();
        let record = json!({"userName": "alice", "IP": "10.0.0.1", "Email": "alice@x.com"});
        let mut outcome = pipeline.ingest_record(record.as_object().unwrap());
        for _ in 0..19 {
            outcome = pipeline.ingest_record(record.as_object().unwrap());
        }
        assert!(outcome.split.sql_record.contains_key("username"));
        assert!(outcome.split.doc_record.contains_key("username"));
        assert!(outcome.split.sql_record.contains_key("sys_ingested_at"));
        assert!(outcome.split.doc_record.contains_key("sys_ingested_at"));
    }

    #[test]
    fn sys_ingested_at_is_unique_and_monotonically_increasing_within_one_feeder() {
        let pipeline = pipeline();
        let mut seen = std::collections::HashSet::new();
        let mut last: Option<String> = None;
        for _ in 0..30 {
            let record = json!({"username": "u"});
            let outcome = pipeline.ingest_record(record.as_object().unwrap());
            let ts = outcome
                .split
                .sql_record
                .get("sys_ingested_at")
                .unwrap()
                .as_str()
                .unwrap()
                .to_string();
            assert!(seen.insert(ts.clone()), "duplicate sys_ingested_at: {ts}");
            if let Some(prev) = &last {
                assert!(&ts >= prev, "timestamps must be monotonically increasing");
            }
            last = Some(ts);
        }
    }

    #[test]
    fn different_feeders_never_collide_on_sys_ingested_at() {
        let pipeline_a = Pipeline::new(MetadataStore::in_memory(), 1);
        let pipeline_b = Pipeline::new(MetadataStore::in_memory(), 2);
        let record = json!({"username": "u"});
        let a = pipeline_a.ingest_record(record.as_object().unwrap());
        let b = pipeline_b.ingest_record(record.as_object().unwrap());
        assert_ne!(
            a.split.sql_record.get("sys_ingested_at"),
            b.split.sql_record.get("sys_ingested_at")
        );
    }

    #[test]
    fn list_and_dict_values_placed_both_serialize_for_sql_and_stay_native_for_doc() {
        let pipeline = pipeline();
        for _ in 0..20 {
            pipeline.ingest_record(json!({"username": "u", "tags": ["x", "y"]}).as_object().unwrap());
        }
        assert!(pipeline.store().field_snapshot("tags").is_some());
    }
}
