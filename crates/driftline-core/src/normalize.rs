//! Field normalizer — maps observed key spellings to a canonical identifier
//! (spec §4.2). Pure, stateless, with a bounded compiled rule set built once.
//!
//! Two stages:
//! - Stage A (syntactic): camelCase/PascalCase → snake_case, lowercase,
//!   collapse repeated underscores, strip leading/trailing underscores.
//! - Stage B (semantic): a fixed, ordered list of compiled patterns maps
//!   semantically equivalent canonical forms onto a single canonical name.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

struct SemanticRule {
    pattern: Regex,
    canonical: &'static str,
}

fn semantic_rules() -> &'static [SemanticRule] {
    static RULES: OnceLock<Vec<SemanticRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        // Order matters only in that the first matching pattern wins; the
        // table below has no overlapping patterns so order is not load
        // bearing today, but is kept close to spec §4.2's table order.
        let table: &[(&str, &str)] = &[
            (r"(?i)^ip(_?addr(ess)?)?$", "ip_address"),
            (r"(?i)^ipv4(_?addr(ess)?)?$", "ip_address"),
            (r"(?i)^user(_?name)?$", "username"),
            (r"(?i)^user_id$", "user_id"),
            (r"(?i)^e?_?mail(_?addr(ess)?)?$", "email"),
            (r"(?i)^(phone|tel|telephone)(_?num(ber)?)?$", "phone"),
            (r"(?i)^(time)?_?stamp$", "timestamp"),
            (r"(?i)^t_?stamp$", "timestamp"),
            (r"(?i)^created(_?at)?$", "created_at"),
            (r"(?i)^updated(_?at)?$", "updated_at"),
            (r"(?i)^(gps_?)?(lat|latitude)$", "gps_lat"),
            (r"(?i)^(gps_?)?(lon|long|longitude)$", "gps_lon"),
            (r"(?i)^dev(ice)?_?id$", "device_id"),
            (r"(?i)^dev(ice)?_?model$", "device_model"),
            (r"(?i)^sess(ion)?_?id$", "session_id"),
            (r"(?i)^net(work)?$", "network"),
            (r"(?i)^bat(tery)?(_?level)?$", "battery"),
            (r"(?i)^os(_?name)?$", "os"),
            (r"(?i)^operating_?system$", "os"),
            (r"(?i)^(app_?)version$", "app_version"),
            (r"(?i)^ver(sion)?$", "version"),
        ];
        table
            .iter()
            .map(|&(pattern, canonical)| SemanticRule {
                pattern: Regex::new(pattern).unwrap(),
                canonical,
            })
            .collect()
    })
}

/// Normalize a single raw key into its canonical form (spec §4.2).
///
/// `normalize(normalize(k)) == normalize(k)` for all `k` — the output of
/// stage B is already closed under stage A (every canonical name in the
/// table is lowercase, underscore-separated, with no redundant underscores)
/// and re-running stage B against an already-canonical name matches the same
/// rule (or none), returning the same string.
pub fn normalize_key(raw: &str) -> String {
    if raw.is_empty() {
        return raw.to_string();
    }

    let syntactic = syntactic_normalize(raw);

    for rule in semantic_rules() {
        if rule.pattern.is_match(&syntactic) {
            return rule.canonical.to_string();
        }
    }
    syntactic
}

fn syntactic_normalize(raw: &str) -> String {
    let boundary_inserted = insert_case_boundaries(raw);
    let lowered = boundary_inserted.to_lowercase();
    let collapsed = collapse_underscores(&lowered);
    collapsed.trim_matches('_').to_string()
}

/// Insert an underscore before each uppercase letter that follows a
/// lowercase letter or digit, and before an uppercase-then-lowercase
/// boundary (`IpAddress` → `Ip_Address`, `userName` → `user_Name`).
fn insert_case_boundaries(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();

            let after_lower_or_digit =
                c.is_uppercase() && (prev.is_lowercase() || prev.is_ascii_digit());
            let upper_then_lower = c.is_uppercase() && next.is_some_and(|n| n.is_lowercase());

            if (after_lower_or_digit || upper_then_lower) && out.chars().last() != Some('_') {
                out.push('_');
            }
        }
        out.push(c);
    }
    out
}

fn collapse_underscores(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_underscore = false;
    for c in s.chars() {
        if c == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(c);
            prev_underscore = false;
        }
    }
    out
}

/// Normalize every key in a JSON object, recursing into nested objects and
/// into objects found inside arrays (spec §4.2, §4.6 step 2).
pub fn normalize_record(record: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(record.len());
    for (key, value) in record {
        let canonical = normalize_key(key);
        out.insert(canonical, normalize_value(value));
    }
    out
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_record(map)),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        other => other.clone(),
    }
}
