//! Core types shared across all driftline-core layers.
//!
//! This module defines the closed-set [`DetectedType`] tag, the per-field
//! [`FieldRecord`] the metadata store accumulates, and the [`Placement`]
//! backends a field can be routed to.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bound on the ring buffer backing `drift_score` (spec §4.3's window `W`).
pub const DRIFT_WINDOW: usize = 50;

/// Bound on the number of sample values retained per field.
pub const MAX_SAMPLE_VALUES: usize = 5;

/// Bound on the length (in chars) of a retained sample value.
pub const MAX_SAMPLE_LEN: usize = 100;

/// A tagged variant drawn from the closed set of detectable value shapes.
///
/// Every JSON value maps to exactly one tag. Order here is cosmetic; the
/// *detection* order (which tag wins on ambiguous strings) lives in
/// [`crate::detect::detect_type`], not in this enum's declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    IpAddress,
    Uuid,
    Email,
    Url,
    Timestamp,
    List,
    Dict,
    Unknown,
}

impl DetectedType {
    /// Semantic tags that act as booster signals in the placement engine
    /// (spec §4.1, §4.4).
    pub fn is_semantic(self) -> bool {
        matches!(
            self,
            DetectedType::Uuid
                | DetectedType::Email
                | DetectedType::IpAddress
                | DetectedType::Timestamp
                | DetectedType::Url
        )
    }

    /// Stable string form used as a map key and in persisted metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            DetectedType::Null => "null",
            DetectedType::Boolean => "boolean",
            DetectedType::Integer => "integer",
            DetectedType::Float => "float",
            DetectedType::String => "string",
            DetectedType::IpAddress => "ip_address",
            DetectedType::Uuid => "uuid",
            DetectedType::Email => "email",
            DetectedType::Url => "url",
            DetectedType::Timestamp => "timestamp",
            DetectedType::List => "list",
            DetectedType::Dict => "dict",
            DetectedType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DetectedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend(s) a canonical field's values are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Sql,
    Doc,
    Both,
    Undecided,
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Placement::Sql => "SQL",
            Placement::Doc => "DOC",
            Placement::Both => "BOTH",
            Placement::Undecided => "UNDECIDED",
        };
        f.write_str(s)
    }
}

/// A `(canonical_key, backend, reason, decided_at)` tuple. A later decision
/// replaces an earlier one under drift (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub backend: Placement,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// A persisted `raw -> canonical` normalization mapping, recorded only when
/// the raw form differs from the canonical one (spec §3, §4.6 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationRule {
    pub raw: String,
    pub canonical: String,
}

/// Per canonical-key accumulator in the metadata store (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRecord {
    pub appearances: u64,
    pub type_counts: HashMap<String, u64>,
    pub sample_values: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub null_count: u64,
    pub placement: Placement,
    pub quarantined: bool,
    /// Ring buffer of the last [`DRIFT_WINDOW`] detected tags, oldest first.
    /// Backs `drift_score` (spec §4.3). Not semantically part of the spec's
    /// data model but required to compute it incrementally.
    #[serde(default)]
    pub recent_tags: VecDeque<DetectedType>,
}

impl FieldRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            appearances: 0,
            type_counts: HashMap::new(),
            sample_values: Vec::new(),
            first_seen: now,
            last_seen: now,
            null_count: 0,
            placement: Placement::Undecided,
            quarantined: false,
            recent_tags: VecDeque::with_capacity(DRIFT_WINDOW),
        }
    }

    /// `appearances` as appear in invariant `sum(type_counts) == appearances`.
    pub fn null_ratio(&self) -> f64 {
        if self.appearances == 0 {
            0.0
        } else {
            self.null_count as f64 / self.appearances as f64
        }
    }

    /// `argmax(type_counts)`, ties broken by first-insertion order (spec §4.3).
    /// `type_counts` is a `HashMap` so insertion order isn't preserved by the
    /// map itself; `recent_tags` plus `type_counts` together let us recover a
    /// stable tie-break by scanning the tag names observed so far in the
    /// order they first appeared in `recent_tags`... but that ring buffer is
    /// bounded, so for the tie-break we fall back to a deterministic order:
    /// lexicographic on the tag name. This is documented in DESIGN.md as the
    /// Open Question resolution for tie-breaking order.
    pub fn dominant_type(&self) -> Option<DetectedType> {
        if self.type_counts.is_empty() {
            return None;
        }
        let mut best: Option<(&str, u64)> = None;
        for (tag, &count) in &self.type_counts {
            match best {
                None => best = Some((tag, count)),
                Some((best_tag, best_count)) => {
                    if count > best_count || (count == best_count && tag.as_str() < best_tag) {
                        best = Some((tag, count));
                    }
                }
            }
        }
        best.and_then(|(tag, _)| parse_detected_type(tag))
    }

    /// `type_counts[dominant_type] / appearances` (spec §4.3).
    pub fn type_stability(&self) -> f64 {
        if self.appearances == 0 {
            return 0.0;
        }
        match self.dominant_type() {
            Some(dom) => {
                let count = self.type_counts.get(dom.as_str()).copied().unwrap_or(0);
                count as f64 / self.appearances as f64
            }
            None => 0.0,
        }
    }

    /// `1 - (count_of_dominant_type_in_last_W_appearances / W)` where
    /// `W = min(appearances, DRIFT_WINDOW)` (spec §4.3).
    pub fn drift_score(&self) -> f64 {
        let window_len = self.recent_tags.len();
        if window_len == 0 {
            return 0.0;
        }
        let Some(dom) = self.dominant_type() else {
            return 0.0;
        };
        let matches = self.recent_tags.iter().filter(|&&t| t == dom).count();
        1.0 - (matches as f64 / window_len as f64)
    }
}

fn parse_detected_type(s: &str) -> Option<DetectedType> {
    use DetectedType::*;
    Some(match s {
        "null" => Null,
        "boolean" => Boolean,
        "integer" => Integer,
        "float" => Float,
        "string" => String,
        "ip_address" => IpAddress,
        "uuid" => Uuid,
        "email" => Email,
        "url" => Url,
        "timestamp" => Timestamp,
        "list" => List,
        "dict" => Dict,
        "unknown" => Unknown,
        _ => return None,
    })
}

/// Process-wide counters tracked by the metadata store (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCounters {
    pub total_records: u64,
    pub session_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GlobalCounters {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_records: 0,
            session_start: now,
            last_updated: now,
        }
    }
}
