//! Deep dependency traversal.
//!
//! A shallow getter only touches the properties it reads. Deep watchers need
//! to re-run when anything nested under their value mutates, so after
//! evaluation the result is traversed while the watcher is still the active
//! target: every tracked read performed here registers another dependency
//! edge.
//!
//! The walk is iterative (a worklist, not recursion, so pathological nesting
//! cannot overflow the stack) and keeps a seen set keyed by observer root-Dep
//! id so shared and cyclic subtrees are visited once.

use std::collections::HashSet;

use super::value::Value;

/// Touch every reachable property of `value` so each one is collected as a
/// dependency of the currently evaluating watcher.
pub fn traverse(value: &Value) {
    let mut seen: HashSet<u64> = HashSet::new();
    let mut pending: Vec<Value> = vec![value.clone()];

    while let Some(current) = pending.pop() {
        match &current {
            Value::Map(map) => {
                if map.is_frozen() {
                    continue;
                }
                if let Some(ob) = map.observer() {
                    if !seen.insert(ob.dep_id()) {
                        continue;
                    }
                }
                // Key listing is untracked; the tracked read of each value
                // is what registers the per-key edge.
                let keys: Vec<String> =
                    map.inner.entries.read().keys().cloned().collect();
                for key in keys {
                    pending.push(map.get(&key));
                }
            }
            Value::List(list) => {
                if list.is_frozen() {
                    continue;
                }
                if let Some(ob) = list.observer() {
                    if !seen.insert(ob.dep_id()) {
                        continue;
                    }
                }
                let len = list.inner.items.read().len();
                for index in 0..len {
                    pending.push(list.get(index));
                }
            }
            // Scalars and host objects have no reactive interior.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::observe::observe;
    use serde_json::json;

    #[test]
    fn traverse_handles_cycles() {
        let value = Value::from_json(json!({"a": 1}));
        observe(&value).unwrap();
        let map = value.as_map().unwrap();
        // Self-reference: map.self = map
        map.set("self", value.clone()).unwrap();

        // Must terminate.
        traverse(&value);
    }

    #[test]
    fn traverse_skips_frozen_subtrees() {
        let value = Value::from_json(json!({"frozen": {"x": 1}, "live": {"y": 2}}));
        let frozen = value.as_map().unwrap().get("frozen");
        frozen.as_map().unwrap().freeze();
        observe(&value).unwrap();

        // No panic, frozen subtree untouched.
        traverse(&value);
        assert!(frozen.observer().is_none());
    }
}
