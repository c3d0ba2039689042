//! Type detector — classifies a [`serde_json::Value`] into a [`DetectedType`].
//!
//! Pure and stateless. Detection order matters: later checks would
//! misclassify if tried first (an IP-shaped string must not fall through to
//! `string` before the IP pattern runs, a bool must not be read as an
//! integer, etc). See spec §4.1 for the full ordering rationale.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::DetectedType;

struct Patterns {
    uuid: Regex,
    ipv4: Regex,
    email: Regex,
    url: Regex,
    iso_timestamp: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        uuid: Regex::new(
            r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
        )
        .unwrap(),
        ipv4: Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").unwrap(),
        email: Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap(),
        url: Regex::new(r"^https?://\S+$").unwrap(),
        iso_timestamp: Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").unwrap(),
    })
}

/// Detect the semantic type of a JSON value (spec §4.1).
///
/// Decision order (first match wins):
/// null → boolean → integer → float → list → dict → string semantic
/// patterns (uuid → ip_address → email → url → iso timestamp → string).
pub fn detect_type(value: &Value) -> DetectedType {
    match value {
        Value::Null => DetectedType::Null,
        Value::Bool(_) => DetectedType::Boolean,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                DetectedType::Integer
            } else {
                DetectedType::Float
            }
        }
        Value::Array(_) => DetectedType::List,
        Value::Object(_) => DetectedType::Dict,
        Value::String(s) => detect_string(s),
    }
}

fn detect_string(s: &str) -> DetectedType {
    if s.is_empty() {
        return DetectedType::String;
    }
    let p = patterns();

    if p.uuid.is_match(s) {
        return DetectedType::Uuid;
    }
    if is_valid_ipv4(s, &p.ipv4) {
        return DetectedType::IpAddress;
    }
    if p.email.is_match(s) {
        return DetectedType::Email;
    }
    if p.url.is_match(s) {
        return DetectedType::Url;
    }
    if p.iso_timestamp.is_match(s) {
        return DetectedType::Timestamp;
    }
    DetectedType::String
}

/// Guards against `"1.2"` (too few octets) and `"999.1.1.1"` (octet out of
/// range) being misclassified as an IP address (spec §4.1).
fn is_valid_ipv4(s: &str, pattern: &Regex) -> bool {
    let Some(caps) = pattern.captures(s) else {
        return false;
    };
    for i in 1..=4 {
        let Ok(octet) = caps[i].parse::<u16>() else {
            return false;
        };
        if octet > 255 {
            return false;
        }
    }
    true
}

/// Map a detected tag to the relational column type used by the SQL adapter
/// (spec §4.1). `Null` maps to a placeholder `TEXT` column, revised only by
/// schema evolution — tags never migrate once assigned (spec §7).
pub fn sql_column_type(tag: DetectedType) -> &'static str {
    match tag {
        DetectedType::Boolean => "BOOLEAN",
        DetectedType::Integer => "INTEGER",
        DetectedType::Float => "REAL",
        DetectedType::IpAddress => "VARCHAR(15)",
        DetectedType::Uuid => "VARCHAR(36)",
        DetectedType::Email => "VARCHAR(255)",
        DetectedType::Url => "TEXT",
        DetectedType::Timestamp => "TIMESTAMP",
        DetectedType::String => "TEXT",
        DetectedType::Null => "TEXT",
        DetectedType::List | DetectedType::Dict => "TEXT",
        DetectedType::Unknown => "TEXT",
    }
}
