//! Observation
//!
//! Attaching an [`Observer`] to a container instruments it: reads start
//! registering dependency edges and writes start notifying. Observation is
//! recursive (children of an observed container are observed too) and
//! idempotent (a container is wrapped at most once; re-observing returns the
//! existing record).
//!
//! Scalars, host objects, and frozen containers are never observed.
//!
//! # Suspending observation
//!
//! Some call sites resolve values that must not become reactive roots of
//! their own (e.g. default values for inputs). [`ObserveGuard::pause`]
//! suspends new observation on the current thread and restores the previous
//! state when dropped, so the toggle cannot leak past an early return.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::dep::Dep;
use super::value::{ContainerMeta, Value};
use crate::error::ReactiveError;

/// Per-container record marking a value as instrumented.
///
/// Holds the container's root ("shape") Dep, notified when whole keys or
/// elements are added or removed (as opposed to the per-key Deps that track
/// value changes), and a count of how many scopes own the container as root
/// state.
pub struct Observer {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    dep: Dep,
    root_count: AtomicUsize,
}

impl Observer {
    fn new() -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                dep: Dep::new(),
                root_count: AtomicUsize::new(0),
            }),
        }
    }

    /// The container's root Dep, tracking shape-level changes.
    pub fn dep(&self) -> Dep {
        self.inner.dep.clone()
    }

    pub fn dep_id(&self) -> u64 {
        self.inner.dep.id()
    }

    /// Whether any scope owns this container as root state.
    pub fn is_root(&self) -> bool {
        self.inner.root_count.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn mark_root(&self) {
        self.inner.root_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one root claim on the container. Once every owning scope has
    /// released it, shape changes are allowed again.
    pub(crate) fn release_root(&self) {
        let _ = self
            .inner
            .root_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl Clone for Observer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("dep_id", &self.dep_id())
            .field("is_root", &self.is_root())
            .finish()
    }
}

thread_local! {
    static SHOULD_OBSERVE: Cell<bool> = const { Cell::new(true) };
}

pub(crate) fn should_observe() -> bool {
    SHOULD_OBSERVE.with(Cell::get)
}

/// Guard that suspends new observation until dropped.
pub struct ObserveGuard {
    previous: bool,
}

impl ObserveGuard {
    pub fn pause() -> Self {
        let previous = SHOULD_OBSERVE.with(|flag| flag.replace(false));
        Self { previous }
    }
}

impl Drop for ObserveGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        SHOULD_OBSERVE.with(|flag| flag.set(previous));
    }
}

/// Observe a value, returning its observer record.
///
/// Returns the existing record when the container is already observed;
/// returns `None` for scalars, host objects, frozen containers, and while
/// observation is suspended.
pub fn observe(value: &Value) -> Option<Observer> {
    let meta: &ContainerMeta = match value {
        Value::Map(map) => &map.inner.meta,
        Value::List(list) => &list.inner.meta,
        _ => return None,
    };
    if meta.frozen.load(Ordering::Relaxed) {
        return None;
    }
    if let Some(existing) = meta.observer.read().clone() {
        return Some(existing);
    }
    if !should_observe() {
        return None;
    }

    let ob = Observer::new();
    {
        let mut slot = meta.observer.write();
        // A nested self-reference may have raced in during recursion.
        if let Some(existing) = slot.clone() {
            return Some(existing);
        }
        *slot = Some(ob.clone());
    }

    // Recurse into children. The record is attached before walking so a
    // cyclic reference back to this container terminates immediately.
    match value {
        Value::Map(map) => {
            let children: Vec<Value> = map
                .inner
                .entries
                .read()
                .values()
                .map(|entry| entry.value.clone())
                .collect();
            for child in &children {
                observe(child);
            }
        }
        Value::List(list) => {
            let children: Vec<Value> = list.inner.items.read().clone();
            for child in &children {
                observe(child);
            }
        }
        _ => unreachable!(),
    }
    Some(ob)
}

/// Observe a value as root state, bumping the root count that guards
/// against runtime shape changes on roots.
pub fn observe_root(value: &Value) -> Option<Observer> {
    let ob = observe(value)?;
    ob.mark_root();
    Some(ob)
}

/// Explicit mutation helper for keys that the intercepted paths cannot
/// reach transparently: adding a key to a map or writing a list index.
/// Dispatches on the target and triggers the appropriate notification.
pub fn set(target: &Value, key: &str, value: Value) -> Result<(), ReactiveError> {
    match target {
        Value::Map(map) => map.set(key, value),
        Value::List(list) => match key.parse::<usize>() {
            Ok(index) => list.set(index, value),
            Err(_) => {
                tracing::warn!(target: "filament", key, "list index must be an integer");
                Err(ReactiveError::InvalidPath(key.to_string()))
            }
        },
        _ => {
            tracing::warn!(
                target: "filament",
                key,
                "cannot set a reactive key on a scalar or host value"
            );
            Err(ReactiveError::eval(format!(
                "cannot set key {key:?} on a non-container value"
            )))
        }
    }
}

/// Explicit deletion helper; the removal counterpart of [`set`].
pub fn del(target: &Value, key: &str) -> Result<(), ReactiveError> {
    match target {
        Value::Map(map) => map.remove(key).map(|_| ()),
        Value::List(list) => match key.parse::<usize>() {
            Ok(index) => list.remove(index).map(|_| ()),
            Err(_) => {
                tracing::warn!(target: "filament", key, "list index must be an integer");
                Err(ReactiveError::InvalidPath(key.to_string()))
            }
        },
        _ => {
            tracing::warn!(
                target: "filament",
                key,
                "cannot delete a reactive key on a scalar or host value"
            );
            Err(ReactiveError::eval(format!(
                "cannot delete key {key:?} on a non-container value"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_are_not_observed() {
        assert!(observe(&Value::Int(1)).is_none());
        assert!(observe(&Value::Null).is_none());
        assert!(observe(&Value::Str("x".into())).is_none());
    }

    #[test]
    fn observing_twice_returns_the_same_record() {
        let value = Value::from_json(json!({"a": 1}));
        let first = observe(&value).unwrap();
        let second = observe(&value).unwrap();
        assert_eq!(first.dep_id(), second.dep_id());
    }

    #[test]
    fn observation_recurses_into_children() {
        let value = Value::from_json(json!({"child": {"x": 1}, "items": [{"y": 2}]}));
        observe(&value).unwrap();

        let map = value.as_map().unwrap();
        assert!(map.get("child").observer().is_some());
        let items = map.get("items");
        assert!(items.observer().is_some());
        assert!(items.as_list().unwrap().get(0).observer().is_some());
    }

    #[test]
    fn frozen_containers_are_skipped() {
        let value = Value::from_json(json!({"a": 1}));
        value.as_map().unwrap().freeze();
        assert!(observe(&value).is_none());
    }

    #[test]
    fn pause_guard_suspends_and_restores() {
        let value = Value::from_json(json!({"a": 1}));
        {
            let _guard = ObserveGuard::pause();
            assert!(observe(&value).is_none());
            {
                let _nested = ObserveGuard::pause();
                assert!(!should_observe());
            }
            assert!(!should_observe());
        }
        assert!(should_observe());
        assert!(observe(&value).is_some());
    }

    #[test]
    fn root_containers_refuse_new_keys() {
        let value = Value::from_json(json!({"a": 1}));
        observe_root(&value).unwrap();
        let map = value.as_map().unwrap();
        assert!(matches!(
            map.set("b", Value::Int(2)),
            Err(ReactiveError::RootMutation(_))
        ));
        // Existing keys still writable.
        map.set("a", Value::Int(5)).unwrap();
        assert_eq!(map.get("a").as_i64(), Some(5));
    }

    #[test]
    fn set_helper_adds_keys_to_nested_containers() {
        let value = Value::from_json(json!({"nested": {}}));
        observe_root(&value).unwrap();
        let nested = value.as_map().unwrap().get("nested");
        set(&nested, "fresh", Value::Int(3)).unwrap();
        assert_eq!(
            nested.as_map().unwrap().get("fresh").as_i64(),
            Some(3)
        );
        // The freshly set value is itself observed.
        set(&nested, "deep", Value::from_json(json!({"k": 1}))).unwrap();
        assert!(nested.as_map().unwrap().get("deep").observer().is_some());
    }

    #[test]
    fn del_helper_removes_keys() {
        let value = Value::from_json(json!({"nested": {"a": 1}}));
        observe(&value).unwrap();
        let nested = value.as_map().unwrap().get("nested");
        del(&nested, "a").unwrap();
        assert!(nested.as_map().unwrap().get("a").same(&Value::Null));
        // Deleting an absent key is a no-op.
        del(&nested, "a").unwrap();
    }

    #[test]
    fn set_helper_rejects_scalar_targets() {
        assert!(set(&Value::Int(1), "a", Value::Int(2)).is_err());
        assert!(del(&Value::Null, "a").is_err());
    }
}
