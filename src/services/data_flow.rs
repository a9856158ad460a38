//! Data-flow application: projecting a completed task's context into a
//! downstream task's input.
//!
//! Each mapping pairs a dot path into the target input with an expression
//! over the source `{result, input}` context. Unresolvable sources produce
//! absence, not null-stuffing. Mappings live in a `BTreeMap`, so the output
//! is independent of insertion order.

use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::domain::models::{DataFlow, JsonMap};
use crate::services::condition_evaluator::eval_expression;

/// Compute the target input delta for one edge. A missing or empty
/// `data_flow` yields the empty map.
pub fn apply(data_flow: Option<&DataFlow>, context: &Value) -> JsonMap {
    let mut target = JsonMap::new();
    let Some(flow) = data_flow else {
        return target;
    };

    for (target_path, source_expr) in &flow.mappings {
        match eval_expression(source_expr, context) {
            Ok(Value::Null) => {
                // Unresolved source: omit the key entirely.
            }
            Ok(value) => set_path(&mut target, target_path, value),
            Err(err) => {
                warn!(
                    mapping = %target_path,
                    expression = %source_expr,
                    error = %err,
                    "data-flow mapping skipped"
                );
            }
        }
    }

    target
}

/// Write a value at a dot path, creating intermediate objects. A non-object
/// intermediate is replaced; last writer wins per path.
fn set_path(target: &mut JsonMap, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
}

/// Merge one edge's contribution into a target's input with deterministic
/// fan-in arbitration.
///
/// Objects merge recursively down to leaves; every leaf write records the
/// contributing source task uuid in `provenance` under its full dot path,
/// and a path claimed by a higher source uuid is never overwritten by a
/// lower one. Claims live at leaf granularity, so sources touching disjoint
/// keys never block each other and the converged input is last-writer-wins
/// per path, ordered by source task uuid ascending, regardless of the order
/// in which concurrently completing sources commit.
pub fn merge_contribution(
    input: &mut JsonMap,
    provenance: &mut JsonMap,
    delta: &JsonMap,
    source_id: Uuid,
) {
    merge_level(input, provenance, "", delta, source_id);
}

fn merge_level(
    target: &mut JsonMap,
    provenance: &mut JsonMap,
    prefix: &str,
    delta: &JsonMap,
    source_id: Uuid,
) {
    for (key, value) in delta {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            Value::Object(nested) => {
                let is_object_slot =
                    matches!(target.get(key.as_str()), Some(Value::Object(_)));
                if !is_object_slot {
                    // Filling an empty slot, or restructuring a scalar one:
                    // arbitrated like a write at this path.
                    if !may_write(provenance, &path, source_id) {
                        continue;
                    }
                    provenance.retain(|claimed, _| !covers(&path, claimed));
                    target.insert(key.clone(), Value::Object(Map::new()));
                }
                if let Some(Value::Object(existing)) = target.get_mut(key.as_str()) {
                    merge_level(existing, provenance, &path, nested, source_id);
                }
            }
            leaf => {
                if may_write(provenance, &path, source_id) {
                    claim_path(provenance, &path, source_id);
                    target.insert(key.clone(), leaf.clone());
                }
            }
        }
    }
}

/// A write at `path` is allowed unless a strictly higher source uuid already
/// claims the path, an ancestor of it, or anything nested under it.
fn may_write(provenance: &JsonMap, path: &str, source_id: Uuid) -> bool {
    provenance.iter().all(|(claimed, writer)| {
        if !covers(claimed, path) && !covers(path, claimed) {
            return true;
        }
        match writer.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) {
            Some(existing) => existing <= source_id,
            None => true,
        }
    })
}

/// Claims nested under the written path are superseded by it.
fn claim_path(provenance: &mut JsonMap, path: &str, source_id: Uuid) {
    provenance.retain(|claimed, _| !covers(path, claimed));
    provenance.insert(path.to_string(), Value::String(source_id.to_string()));
}

/// Whether `outer` equals `inner` or is a dot-path ancestor of it.
fn covers(outer: &str, inner: &str) -> bool {
    inner == outer
        || (inner.len() > outer.len()
            && inner.starts_with(outer)
            && inner.as_bytes()[outer.len()] == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn flow(pairs: &[(&str, &str)]) -> DataFlow {
        DataFlow {
            mappings: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn ctx(result: Value) -> Value {
        json!({"result": result, "input": {"origin": "seed"}})
    }

    #[test]
    fn test_missing_data_flow_yields_empty_map() {
        assert!(apply(None, &ctx(json!({"a": 1}))).is_empty());
        assert!(apply(Some(&DataFlow::default()), &ctx(json!({"a": 1}))).is_empty());
    }

    #[test]
    fn test_simple_projection() {
        let flow = flow(&[("weather_data", "result.data")]);
        let out = apply(Some(&flow), &ctx(json!({"data": {"temperature": 25}})));
        assert_eq!(out["weather_data"], json!({"temperature": 25}));
    }

    #[test]
    fn test_nested_target_path() {
        let flow = flow(&[("report.summary.text", "result.text")]);
        let out = apply(Some(&flow), &ctx(json!({"text": "ok"})));
        assert_eq!(out["report"]["summary"]["text"], json!("ok"));
    }

    #[test]
    fn test_unresolvable_source_is_absent() {
        let flow = flow(&[("present", "result.here"), ("gone", "result.not_here")]);
        let out = apply(Some(&flow), &ctx(json!({"here": 1})));
        assert_eq!(out["present"], json!(1));
        assert!(!out.contains_key("gone"));
    }

    #[test]
    fn test_invalid_expression_is_skipped() {
        let flow = flow(&[("good", "result.a"), ("bad", "result.a +")]);
        let out = apply(Some(&flow), &ctx(json!({"a": 1})));
        assert_eq!(out.len(), 1);
        assert_eq!(out["good"], json!(1));
    }

    #[test]
    fn test_input_is_addressable() {
        let flow = flow(&[("carried", "input.origin")]);
        let out = apply(Some(&flow), &ctx(json!({})));
        assert_eq!(out["carried"], json!("seed"));
    }

    #[test]
    fn test_literal_sources() {
        let flow = flow(&[("mode", "'fast'"), ("limit", "10")]);
        let out = apply(Some(&flow), &ctx(json!({})));
        assert_eq!(out["mode"], json!("fast"));
        assert_eq!(out["limit"], json!(10));
    }

    #[test]
    fn test_order_independence() {
        // Same mappings inserted in different orders produce identical output
        let a = flow(&[("x", "result.a"), ("y", "result.b")]);
        let b = flow(&[("y", "result.b"), ("x", "result.a")]);
        let context = ctx(json!({"a": 1, "b": 2}));
        assert_eq!(apply(Some(&a), &context), apply(Some(&b), &context));
    }

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    const LOW: Uuid = Uuid::from_u128(1);
    const HIGH: Uuid = Uuid::from_u128(2);

    #[test]
    fn test_merge_contribution_recursive() {
        let mut input = map(json!({"a": {"x": 1, "y": 2}, "keep": true}));
        let mut provenance = JsonMap::new();

        merge_contribution(
            &mut input,
            &mut provenance,
            &map(json!({"a": {"y": 20, "z": 30}, "new": 1})),
            LOW,
        );

        assert_eq!(
            Value::Object(input),
            json!({"a": {"x": 1, "y": 20, "z": 30}, "keep": true, "new": 1})
        );
        assert_eq!(provenance["a.y"], json!(LOW.to_string()));
        assert_eq!(provenance["a.z"], json!(LOW.to_string()));
        assert_eq!(provenance["new"], json!(LOW.to_string()));
    }

    #[test]
    fn test_higher_source_overwrites_lower() {
        let mut input = JsonMap::new();
        let mut provenance = JsonMap::new();

        merge_contribution(&mut input, &mut provenance, &map(json!({"shared": "L"})), LOW);
        merge_contribution(&mut input, &mut provenance, &map(json!({"shared": "H"})), HIGH);

        assert_eq!(input["shared"], json!("H"));
        assert_eq!(provenance["shared"], json!(HIGH.to_string()));
    }

    #[test]
    fn test_lower_source_cannot_overwrite_higher() {
        let mut input = JsonMap::new();
        let mut provenance = JsonMap::new();

        merge_contribution(&mut input, &mut provenance, &map(json!({"shared": "H"})), HIGH);
        merge_contribution(
            &mut input,
            &mut provenance,
            &map(json!({"shared": "L", "own": 1})),
            LOW,
        );

        // The conflicting path keeps the higher writer; disjoint paths land.
        assert_eq!(input["shared"], json!("H"));
        assert_eq!(input["own"], json!(1));
        assert_eq!(provenance["shared"], json!(HIGH.to_string()));
    }

    #[test]
    fn test_converges_regardless_of_commit_order() {
        let low_delta = map(json!({"merged": {"shared": "L", "from_low": 1}}));
        let high_delta = map(json!({"merged": {"shared": "H", "from_high": 2}}));

        let mut forward = JsonMap::new();
        let mut forward_prov = JsonMap::new();
        merge_contribution(&mut forward, &mut forward_prov, &low_delta, LOW);
        merge_contribution(&mut forward, &mut forward_prov, &high_delta, HIGH);

        let mut reverse = JsonMap::new();
        let mut reverse_prov = JsonMap::new();
        merge_contribution(&mut reverse, &mut reverse_prov, &high_delta, HIGH);
        merge_contribution(&mut reverse, &mut reverse_prov, &low_delta, LOW);

        assert_eq!(forward, reverse);
        assert_eq!(forward["merged"]["shared"], json!("H"));
        assert_eq!(forward["merged"]["from_low"], json!(1));
        assert_eq!(forward["merged"]["from_high"], json!(2));
    }

    #[test]
    fn test_same_source_rewrites_its_own_path() {
        // Duplicate deliveries of the same contribution are idempotent.
        let mut input = JsonMap::new();
        let mut provenance = JsonMap::new();

        merge_contribution(&mut input, &mut provenance, &map(json!({"x": 1})), LOW);
        merge_contribution(&mut input, &mut provenance, &map(json!({"x": 1})), LOW);

        assert_eq!(input["x"], json!(1));
        assert_eq!(provenance.len(), 1);
    }

    #[test]
    fn test_object_over_scalar_arbitrates_on_the_parent_path() {
        let mut input = JsonMap::new();
        let mut provenance = JsonMap::new();

        merge_contribution(&mut input, &mut provenance, &map(json!({"a": 1})), HIGH);
        // Writing a.b would clobber the higher writer's scalar at a.
        merge_contribution(&mut input, &mut provenance, &map(json!({"a": {"b": 2}})), LOW);
        assert_eq!(input["a"], json!(1));

        // A higher source may restructure it; the stale scalar claim is
        // released and the new leaves carry their own claims.
        let restructure = Uuid::from_u128(3);
        merge_contribution(
            &mut input,
            &mut provenance,
            &map(json!({"a": {"b": 2}})),
            restructure,
        );
        assert_eq!(input["a"], json!({"b": 2}));
        assert!(!provenance.contains_key("a"));
        assert_eq!(provenance["a.b"], json!(restructure.to_string()));
    }
}
