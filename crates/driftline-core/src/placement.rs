//! Placement engine — assigns each canonical field to `{Sql, Doc, Both}`
//! based on accumulated statistical evidence (spec §4.4, §4.5).
//!
//! Stateless with respect to decisions already recorded: it consults the
//! [`MetadataStore`] for inputs and writes decisions back into it.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::store::MetadataStore;
use crate::types::{DetectedType, Placement};

/// Tunable constants (spec §4.4's table).
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub freq_high: (f64, f64),
    pub freq_medium: (f64, f64),
    pub stab_stable: (f64, f64),
    pub stab_moderate: (f64, f64),
    pub min_observations: u64,
    pub confidence_threshold: f64,
    pub minor_drift: f64,
    pub moderate_drift: f64,
    pub null_ratio_max: f64,
    pub booster_promotion_count: u32,
    pub relaxed_frequency: f64,
    pub relaxed_stability: f64,
    pub mandatory: HashSet<String>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            freq_high: (0.75, 1.00),
            freq_medium: (0.50, 0.75),
            stab_stable: (0.85, 1.00),
            stab_moderate: (0.70, 0.85),
            min_observations: 10,
            confidence_threshold: 0.65,
            minor_drift: 0.10,
            moderate_drift: 0.25,
            null_ratio_max: 0.05,
            booster_promotion_count: 2,
            relaxed_frequency: 0.50,
            relaxed_stability: 0.75,
            mandatory: ["username", "sys_ingested_at", "t_stamp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreqZone {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StabZone {
    Stable,
    Moderate,
    Unstable,
}

fn unique_indicator_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"\bid\b", r"\buuid\b", r"\bsession\b", r"\bkey\b"]
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

/// Decides where each canonical field's data should live.
pub struct PlacementEngine<'a> {
    store: &'a MetadataStore,
    config: PlacementConfig,
}

impl<'a> PlacementEngine<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self {
            store,
            config: PlacementConfig::default(),
        }
    }

    pub fn with_config(store: &'a MetadataStore, config: PlacementConfig) -> Self {
        Self { store, config }
    }

    /// Run the priority-ordered decision algorithm for `canonical_key`
    /// (spec §4.4). Returns the resulting backend; persists a decision only
    /// when one of steps 2, 5, 6, or 7 fires (steps 3 and 4 return a
    /// provisional `Doc` without writing).
    pub fn decide_placement(&self, canonical_key: &str) -> Placement {
        // Step 1: sticky decisions, unless drift (handled inside the branch
        // below) forces a re-evaluation.
        if let Some(existing) = self.store.get_placement_decision(canonical_key) {
            return self.apply_drift_override(canonical_key, existing.backend);
        }

        // Step 2: mandatory fields.
        if self.config.mandatory.contains(canonical_key) {
            self.store.set_placement_decision(
                canonical_key,
                Placement::Both,
                "mandatory join key".to_string(),
            );
            return Placement::Both;
        }

        // Step 3: unknown field.
        let Some(field) = self.store.field_snapshot(canonical_key) else {
            return Placement::Doc;
        };

        // Step 4: insufficient observations.
        if field.appearances < self.config.min_observations {
            return Placement::Doc;
        }

        // Step 5: nested structure.
        let dominant_type = field.dominant_type();
        if matches!(dominant_type, Some(DetectedType::List) | Some(DetectedType::Dict)) {
            let reason = format!(
                "nested structure (dominant_type={})",
                dominant_type.unwrap()
            );
            self.store
                .set_placement_decision(canonical_key, Placement::Doc, reason);
            return Placement::Doc;
        }

        // Step 6: zone + confidence + boosters.
        let frequency = self.store.frequency(canonical_key);
        let stability = field.type_stability();
        let is_semantic = dominant_type.is_some_and(DetectedType::is_semantic);
        let confidence = Self::confidence(frequency, stability, is_semantic);
        let booster_count = self.booster_count(canonical_key, &field, is_semantic);

        let freq_zone = self.freq_zone(frequency);
        let stab_zone = self.stab_zone(stability);
        let mut decision = self.decide_zone_confidence(
            freq_zone,
            stab_zone,
            confidence,
            booster_count,
            frequency,
            stability,
        );

        // Step 7: drift override, applied before the first persist too —
        // a field can be born quarantined if it drifted during its first
        // MIN_OBSERVATIONS appearances.
        let drift_score = field.drift_score();
        if drift_score >= self.config.minor_drift {
            decision = self.handle_drift(canonical_key, drift_score, decision);
        }

        // Step 8: persist with reasoning.
        let reason = self.reasoning(
            freq_zone,
            stab_zone,
            confidence,
            booster_count,
            drift_score,
            frequency,
            stability,
            decision,
        );
        self.store
            .set_placement_decision(canonical_key, decision, reason);
        decision
    }

    /// Re-run the drift check against a sticky decision (spec §4.4 step 7,
    /// which is the only way a cached decision changes).
    fn apply_drift_override(&self, canonical_key: &str, current: Placement) -> Placement {
        let Some(field) = self.store.field_snapshot(canonical_key) else {
            return current;
        };
        let drift_score = field.drift_score();
        if drift_score < self.config.minor_drift {
            return current;
        }
        let updated = self.handle_drift(canonical_key, drift_score, current);
        if updated != current {
            let reason = format!(
                "drift override on cached decision (drift={drift_score:.2})"
            );
            self.store
                .set_placement_decision(canonical_key, updated, reason);
        }
        updated
    }

    fn handle_drift(&self, canonical_key: &str, drift_score: f64, current: Placement) -> Placement {
        if drift_score < self.config.moderate_drift {
            if current == Placement::Sql {
                Placement::Doc
            } else {
                current
            }
        } else {
            self.store.mark_quarantined(canonical_key, drift_score);
            Placement::Doc
        }
    }

    fn confidence(frequency: f64, stability: f64, is_semantic: bool) -> f64 {
        let freq_confidence = (frequency / 0.80).min(1.0);
        let semantic_confidence = if is_semantic { 0.8 } else { 0.0 };
        (freq_confidence + stability + semantic_confidence) / 3.0
    }

    fn booster_count(&self, canonical_key: &str, field: &crate::types::FieldRecord, is_semantic: bool) -> u32 {
        let mut boosters = 0;
        if is_semantic {
            boosters += 1;
        }
        if self.should_be_unique(canonical_key) {
            boosters += 1;
        }
        if field.null_ratio() < self.config.null_ratio_max {
            boosters += 1;
        }
        boosters
    }

    fn freq_zone(&self, frequency: f64) -> FreqZone {
        let (lo, hi) = self.config.freq_high;
        if frequency >= lo && frequency <= hi {
            return FreqZone::High;
        }
        let (lo, hi) = self.config.freq_medium;
        if frequency >= lo && frequency < hi {
            return FreqZone::Medium;
        }
        FreqZone::Low
    }

    fn stab_zone(&self, stability: f64) -> StabZone {
        let (lo, hi) = self.config.stab_stable;
        if stability >= lo && stability <= hi {
            return StabZone::Stable;
        }
        let (lo, hi) = self.config.stab_moderate;
        if stability >= lo && stability < hi {
            return StabZone::Moderate;
        }
        StabZone::Unstable
    }

    #[allow(clippy::too_many_arguments)]
    fn decide_zone_confidence(
        &self,
        freq_zone: FreqZone,
        stab_zone: StabZone,
        confidence: f64,
        booster_count: u32,
        frequency: f64,
        stability: f64,
    ) -> Placement {
        if freq_zone == FreqZone::High
            && matches!(stab_zone, StabZone::Stable | StabZone::Moderate)
        {
            return Placement::Sql;
        }
        if freq_zone == FreqZone::Medium
            && stab_zone == StabZone::Stable
            && confidence >= 0.60
        {
            return Placement::Sql;
        }
        if booster_count >= self.config.booster_promotion_count
            && freq_zone != FreqZone::Low
            && confidence >= 0.55
            && frequency >= self.config.relaxed_frequency
            && stability >= self.config.relaxed_stability
        {
            return Placement::Sql;
        }
        Placement::Doc
    }

    #[allow(clippy::too_many_arguments)]
    fn reasoning(
        &self,
        freq_zone: FreqZone,
        stab_zone: StabZone,
        confidence: f64,
        booster_count: u32,
        drift_score: f64,
        frequency: f64,
        stability: f64,
        decision: Placement,
    ) -> String {
        let freq_zone_name = match freq_zone {
            FreqZone::High => "high",
            FreqZone::Medium => "medium",
            FreqZone::Low => "low",
        };
        let stab_zone_name = match stab_zone {
            StabZone::Stable => "stable",
            StabZone::Moderate => "moderate",
            StabZone::Unstable => "unstable",
        };
        let mut parts = vec![
            format!("freq_zone={freq_zone_name}({frequency:.2})"),
            format!("stab_zone={stab_zone_name}({stability:.2})"),
            format!("confidence={confidence:.2}"),
        ];
        if booster_count > 0 {
            parts.push(format!("boosters={booster_count}"));
        }
        if drift_score >= self.config.minor_drift {
            parts.push(format!("drift={drift_score:.2}"));
        }

        let headline = if decision == Placement::Sql {
            if freq_zone == FreqZone::High {
                format!("high frequency + {stab_zone_name} stability")
            } else if booster_count >= self.config.booster_promotion_count {
                format!("promoted by {booster_count} boosters")
            } else {
                "medium frequency with stable types".to_string()
            }
        } else if drift_score >= self.config.moderate_drift {
            "severe drift quarantine".to_string()
        } else if drift_score >= self.config.minor_drift {
            "type drift detected".to_string()
        } else if freq_zone == FreqZone::Low {
            "low frequency".to_string()
        } else {
            "insufficient confidence for SQL".to_string()
        };

        format!("{headline} [{}]", parts.join(", "))
    }

    /// `should_be_unique(k)` (spec §4.5).
    pub fn should_be_unique(&self, canonical_key: &str) -> bool {
        if canonical_key == "username" {
            return false;
        }
        let has_unique_name = unique_indicator_patterns()
            .iter()
            .any(|pattern| pattern.is_match(canonical_key));
        if !has_unique_name {
            return false;
        }

        let Some(field) = self.store.field_snapshot(canonical_key) else {
            return false;
        };
        let has_unique_type =
            matches!(field.dominant_type(), Some(DetectedType::Uuid) | Some(DetectedType::Integer));

        let has_high_cardinality = if field.sample_values.len() >= 2 {
            let unique: HashSet<&String> = field.sample_values.iter().collect();
            (unique.len() as f64 / field.sample_values.len() as f64) > 0.9
        } else {
            false
        };

        has_unique_type || has_high_cardinality
    }

    /// `should_be_indexed(k)` (spec §4.5).
    pub fn should_be_indexed(&self, canonical_key: &str) -> bool {
        const QUERY_FIELDS: &[&str] = &[
            "username",
            "timestamp",
            "t_stamp",
            "sys_ingested_at",
            "session_id",
            "device_id",
            "user_id",
        ];
        if QUERY_FIELDS.contains(&canonical_key) {
            return true;
        }
        self.store.frequency(canonical_key) >= 0.50
    }

    /// Aggregate counts-by-backend summary (supplemented from
    /// original_source's `get_placement_summary`, spec_full §8).
    pub fn summary(&self) -> PlacementSummary {
        let mut summary = PlacementSummary::default();
        for key in self.store.all_keys() {
            if let Some(decision) = self.store.get_placement_decision(&key) {
                match decision.backend {
                    Placement::Sql => summary.sql_fields.push(key),
                    Placement::Doc => summary.doc_fields.push(key),
                    Placement::Both => summary.both_fields.push(key),
                    Placement::Undecided => {}
                }
            }
        }
        summary
    }
}

/// Counts-by-backend summary of all placement decisions made so far.
#[derive(Debug, Clone, Default)]
pub struct PlacementSummary {
    pub sql_fields: Vec<String>,
    pub doc_fields: Vec<String>,
    pub both_fields: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn observe(store: &MetadataStore, key: &str, tag: DetectedType, value: serde_json::Value, times: u64) {
        for _ in 0..times {
            store.increment_total_records();
            store.update_field_stats(key, tag, &value);
        }
    }

    #[test]
    fn mandatory_fields_are_always_both() {
        let store = MetadataStore::in_memory();
        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("username"), Placement::Both);
        assert_eq!(engine.decide_placement("sys_ingested_at"), Placement::Both);
        assert_eq!(engine.decide_placement("t_stamp"), Placement::Both);
    }

    #[test]
    fn unknown_field_defers_without_persisting() {
        let store = MetadataStore::in_memory();
        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("mystery"), Placement::Doc);
        assert!(store.get_placement_decision("mystery").is_none());
    }

    #[test]
    fn below_min_observations_defers_without_persisting() {
        let store = MetadataStore::in_memory();
        observe(&store, "rare", DetectedType::Integer, json!(1), 5);
        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("rare"), Placement::Doc);
        assert!(store.get_placement_decision("rare").is_none());
    }

    #[test]
    fn high_frequency_stable_field_goes_sql() {
        let store = MetadataStore::in_memory();
        observe(&store, "email", DetectedType::Email, json!("u@x.com"), 20);
        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("email"), Placement::Sql);
    }

    #[test]
    fn nested_field_goes_doc() {
        let store = MetadataStore::in_memory();
        observe(&store, "metadata", DetectedType::Dict, json!({"a": 1}), 20);
        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("metadata"), Placement::Doc);
    }

    #[test]
    fn unstable_type_mix_never_reaches_sql() {
        let store = MetadataStore::in_memory();
        for i in 0..100u64 {
            store.increment_total_records();
            if i % 2 == 0 {
                store.update_field_stats("battery", DetectedType::Integer, &json!(50));
            } else {
                store.update_field_stats("battery", DetectedType::String, &json!("charging"));
            }
        }
        let field = store.field_snapshot("battery").unwrap();
        assert_eq!(field.type_stability(), 0.5);

        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("battery"), Placement::Doc);
    }

    #[test]
    fn sparse_field_is_low_frequency_doc() {
        let store = MetadataStore::in_memory();
        for i in 0..100u64 {
            store.increment_total_records();
            if i < 20 {
                store.update_field_stats("altitude", DetectedType::Float, &json!(100.0));
            }
        }
        let engine = PlacementEngine::new(&store);
        assert_eq!(store.frequency("altitude"), 0.20);
        assert_eq!(engine.decide_placement("altitude"), Placement::Doc);
    }

    #[test]
    fn drift_downgrades_a_sql_field_and_quarantines_on_moderate_drift() {
        let store = MetadataStore::in_memory();
        for _ in 0..40 {
            store.increment_total_records();
            store.update_field_stats("battery", DetectedType::Integer, &json!(50));
        }
        let engine = PlacementEngine::new(&store);
        assert_eq!(engine.decide_placement("battery"), Placement::Sql);

        for _ in 0..20 {
            store.increment_total_records();
            store.update_field_stats("battery", DetectedType::String, &json!("charging"));
        }

        let field = store.field_snapshot("battery").unwrap();
        assert!(field.drift_score() >= PlacementConfig::default().moderate_drift);

        assert_eq!(engine.decide_placement("battery"), Placement::Doc);
        let snapshot = store.field_snapshot("battery").unwrap();
        assert!(snapshot.quarantined);
    }

    #[test]
    fn unique_device_id_detected_as_unique_candidate() {
        let store = MetadataStore::in_memory();
        for i in 0..50u64 {
            store.increment_total_records();
            let uuid = format!("550e8400-e29b-41d4-a716-{i:012}");
            store.update_field_stats("device_id", DetectedType::Uuid, &json!(uuid));
        }
        let engine = PlacementEngine::new(&store);
        assert!(engine.should_be_unique("device_id"));
    }

    #[test]
    fn username_is_never_a_unique_candidate() {
        let store = MetadataStore::in_memory();
        for i in 0..20u64 {
            store.increment_total_records();
            store.update_field_stats("username", DetectedType::String, &json!(format!("u{i}")));
        }
        let engine = PlacementEngine::new(&store);
        assert!(!engine.should_be_unique("username"));
    }

    #[test]
    fn decisions_are_sticky_across_repeated_calls() {
        let store = MetadataStore::in_memory();
        observe(&store, "email", DetectedType::Email, json!("u@x.com"), 20);
        let engine = PlacementEngine::new(&store);
        let first = engine.decide_placement("email");
        let decided_at_first = store.get_placement_decision("email").unwrap().decided_at;
        let second = engine.decide_placement("email");
        let decided_at_second = store.get_placement_decision("email").unwrap().decided_at;
        assert_eq!(first, second);
        assert_eq!(decided_at_first, decided_at_second);
    }
}
