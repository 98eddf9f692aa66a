//! Property normalization and merge policy.
//!
//! These functions are pure. Every graph store calls them inside its own
//! atomic section, so the in-memory and Neo4j backends agree on what a merge
//! means.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::{Number, Value};

use crate::schema::IndexPolicy;
use crate::types::PropertyMap;

/// Canonicalize a single observed value.
///
/// Strings are trimmed. Floats with an integral value become integers, so
/// `8080.0` and `8080` produce the same natural key.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.len() == s.len() {
                Value::String(s)
            } else {
                Value::String(trimmed.to_string())
            }
        }
        Value::Number(n) => Value::Number(normalize_number(n)),
        other => other,
    }
}

fn normalize_number(n: Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n;
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Number::from(f as i64)
        }
        _ => n,
    }
}

/// Normalize every value of an observed property map. Null values mean
/// "not observed" and are dropped.
pub fn normalize_properties(properties: PropertyMap) -> PropertyMap {
    properties
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k, normalize_value(v)))
        .collect()
}

/// Order two index-property values.
///
/// Numbers compare numerically and RFC 3339 timestamps chronologically;
/// other strings compare lexicographically. `None` means the values are of
/// different kinds and cannot be ordered.
pub fn compare_index_values(stored: &Value, observed: &Value) -> Option<Ordering> {
    match (stored, observed) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::String(a), Value::String(b)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.cmp(b)),
        },
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return Some(a.cmp(&b));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Overlay observed properties onto a stored node's properties.
///
/// Observed values overwrite same-named properties; absent properties are
/// left untouched. Returns the names of the properties whose value actually
/// changed, sorted.
pub fn merge_node_properties(stored: &mut PropertyMap, observed: &PropertyMap) -> Vec<String> {
    overlay(stored, observed)
}

fn overlay(stored: &mut PropertyMap, observed: &PropertyMap) -> Vec<String> {
    let mut changed = Vec::new();
    for (name, value) in observed {
        if stored.get(name) != Some(value) {
            stored.insert(name.clone(), value.clone());
            changed.push(name.clone());
        }
    }
    changed.sort();
    changed
}

/// Properties a new edge is created with: relationship defaults overlaid
/// with the observation.
pub fn seed_edge_properties(defaults: &PropertyMap, observed: &PropertyMap) -> PropertyMap {
    let mut seeded = defaults.clone();
    for (name, value) in observed {
        seeded.insert(name.clone(), value.clone());
    }
    seeded
}

/// Outcome of merging an observation into an existing edge.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeMerge {
    /// Every observed value already matched the stored edge.
    Unchanged,
    /// The edge should be replaced with `properties`.
    Updated {
        properties: PropertyMap,
        changed_fields: Vec<String>,
    },
    /// The observation carries an older monotonic index value. The stored
    /// edge is kept as-is.
    Stale { stored: Value, observed: Value },
}

/// Decide how an observation merges into a stored edge.
///
/// `observed` holds the observation's own properties plus the effective
/// index value. Relationship defaults are not part of it: they only seed new
/// edges.
pub fn merge_edge_properties(
    stored: &PropertyMap,
    index_property: &str,
    policy: IndexPolicy,
    observed: &PropertyMap,
) -> EdgeMerge {
    if policy == IndexPolicy::Monotonic {
        if let (Some(current), Some(incoming)) = (stored.get(index_property), observed.get(index_property)) {
            match compare_index_values(current, incoming) {
                Some(Ordering::Greater) => {
                    return EdgeMerge::Stale {
                        stored: current.clone(),
                        observed: incoming.clone(),
                    };
                }
                Some(_) => {}
                None => {
                    tracing::warn!(
                        index_property,
                        stored = %current,
                        observed = %incoming,
                        "Incomparable index values, applying last-writer-wins"
                    );
                }
            }
        }
    }

    let mut properties = stored.clone();
    let changed_fields = overlay(&mut properties, observed);
    if changed_fields.is_empty() {
        EdgeMerge::Unchanged
    } else {
        EdgeMerge::Updated {
            properties,
            changed_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> PropertyMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn normalizes_strings_and_integral_floats() {
        assert_eq!(normalize_value(json!("  api.example.com ")), json!("api.example.com"));
        assert_eq!(normalize_value(json!(8080.0)), json!(8080));
        assert_eq!(normalize_value(json!(7.5)), json!(7.5));
        assert_eq!(normalize_value(json!(true)), json!(true));
        assert_eq!(normalize_value(json!("Host")), json!("Host"));
    }

    #[test]
    fn normalize_properties_drops_nulls() {
        let normalized = normalize_properties(props(json!({ "name": " x ", "version": null })));
        assert_eq!(normalized, props(json!({ "name": "x" })));
    }

    #[test]
    fn compares_numbers_timestamps_and_strings() {
        assert_eq!(compare_index_values(&json!(100), &json!(50)), Some(Ordering::Greater));
        assert_eq!(compare_index_values(&json!(1.5), &json!(2)), Some(Ordering::Less));
        assert_eq!(
            compare_index_values(&json!("2024-05-01T10:00:00+02:00"), &json!("2024-05-01T09:00:00Z")),
            Some(Ordering::Less)
        );
        assert_eq!(compare_index_values(&json!("open"), &json!("closed")), Some(Ordering::Greater));
        assert_eq!(compare_index_values(&json!("100"), &json!(100)), None);
    }

    #[test]
    fn node_merge_reports_only_changed_fields() {
        let mut stored = props(json!({ "name": "x", "os": "linux" }));
        let changed = merge_node_properties(&mut stored, &props(json!({ "name": "x", "os": "bsd", "role": "web" })));
        assert_eq!(changed, vec!["os", "role"]);
        assert_eq!(stored, props(json!({ "name": "x", "os": "bsd", "role": "web" })));

        let again = merge_node_properties(&mut stored, &props(json!({ "os": "bsd" })));
        assert!(again.is_empty());
    }

    #[test]
    fn seeded_edges_prefer_observed_values() {
        let seeded = seed_edge_properties(
            &props(json!({ "status": "open", "source": "dns" })),
            &props(json!({ "status": "filtered" })),
        );
        assert_eq!(seeded, props(json!({ "status": "filtered", "source": "dns" })));
    }

    #[test]
    fn monotonic_edge_rejects_older_index_value() {
        let stored = props(json!({ "last_seen": 100 }));
        let merge = merge_edge_properties(&stored, "last_seen", IndexPolicy::Monotonic, &props(json!({ "last_seen": 50 })));
        assert_eq!(
            merge,
            EdgeMerge::Stale {
                stored: json!(100),
                observed: json!(50)
            }
        );
    }

    #[test]
    fn monotonic_edge_accepts_newer_and_equal_values() {
        let stored = props(json!({ "last_seen": 100, "source": "dns" }));
        let newer = merge_edge_properties(&stored, "last_seen", IndexPolicy::Monotonic, &props(json!({ "last_seen": 150 })));
        assert_eq!(
            newer,
            EdgeMerge::Updated {
                properties: props(json!({ "last_seen": 150, "source": "dns" })),
                changed_fields: vec!["last_seen".to_string()],
            }
        );

        let same = merge_edge_properties(&stored, "last_seen", IndexPolicy::Monotonic, &props(json!({ "last_seen": 100 })));
        assert_eq!(same, EdgeMerge::Unchanged);
    }

    #[test]
    fn overwrite_edge_is_last_writer_wins() {
        let stored = props(json!({ "status": "open" }));
        let merge = merge_edge_properties(&stored, "status", IndexPolicy::Overwrite, &props(json!({ "status": "closed" })));
        assert!(matches!(merge, EdgeMerge::Updated { ref changed_fields, .. } if changed_fields == &["status"]));
    }

    #[test]
    fn incomparable_monotonic_values_apply() {
        let stored = props(json!({ "last_seen": "yesterday" }));
        let merge = merge_edge_properties(&stored, "last_seen", IndexPolicy::Monotonic, &props(json!({ "last_seen": 5 })));
        assert!(matches!(merge, EdgeMerge::Updated { .. }));
    }
}
