//! Observable Value Tree
//!
//! Rust has no way to intercept arbitrary field access on plain structs, so
//! observation is modeled as an explicit value tree: a [`Value`] is either a
//! scalar, an opaque host object, or a shared container ([`MapRef`] /
//! [`ListRef`]) whose read and write methods perform the dependency
//! bookkeeping that accessor interception performs in dynamic hosts.
//!
//! # Tracking rules
//!
//! - Reading a map key registers the key's Dep; if the value is itself an
//!   observed container its root Dep is registered too, and lists register
//!   every element's root Dep recursively (lists have no per-index Deps).
//! - Reading container shape (`keys`, `len`) registers the root Dep.
//! - Writing a map key compares first (NaN counts as equal to NaN) and does
//!   nothing when the value is unchanged; otherwise it stores, re-observes
//!   the new value, and notifies the key's Dep.
//! - The mutating list operations (`push`, `pop`, `shift`, `unshift`,
//!   `splice`, `sort_by`, `reverse`) observe inserted elements and notify the
//!   container's root Dep. Index-level changes are tracked at container-root
//!   granularity; consumers needing finer reactivity re-read the list.
//!
//! Tracking and notification only happen once a container has been observed
//! (see `observe`); un-instrumented containers behave as plain data.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use super::dep::Dep;
use super::observe::{self, Observer};
use crate::error::ReactiveError;

/// A value in an observable state tree.
///
/// Scalars are compared by value (with NaN equal to itself for change
/// detection); containers are shared by reference, so cloning a `Value` is
/// cheap and clones of a container alias the same state.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(MapRef),
    List(ListRef),
    /// An opaque host-layer object (e.g. a render node). Never observed, so
    /// display-tree internals cannot create reactivity cycles.
    Host(HostObject),
}

impl Value {
    /// Sameness as used for change detection: scalar equality with NaN equal
    /// to NaN, container and host identity by shared reference.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Value::Host(a), Value::Host(b)) => a.same(b),
            _ => false,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Map(_) | Value::List(_))
    }

    /// The container's observer record, if this value is an observed
    /// container.
    pub fn observer(&self) -> Option<Observer> {
        match self {
            Value::Map(map) => map.observer(),
            Value::List(list) => list.observer(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapRef> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Build a value tree from JSON. Containers come back un-observed; pass
    /// the result to `observe` (or hand it to a `Scope`) to instrument it.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::List(ListRef::from_values(
                items.into_iter().map(Value::from_json).collect(),
            )),
            serde_json::Value::Object(entries) => Value::Map(MapRef::from_entries(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from_json(value))),
            )),
        }
    }

    /// Snapshot the tree as JSON. Reads are untracked; host objects
    /// serialize as null. Not defined for cyclic trees.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Host(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Map(map) => {
                let entries = map.inner.entries.read();
                serde_json::Value::Object(
                    entries
                        .iter()
                        .map(|(key, entry)| (key.clone(), entry.value.to_json()))
                        .collect(),
                )
            }
            Value::List(list) => {
                let items = list.inner.items.read();
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Host(_) => f.write_str("Host(..)"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<MapRef> for Value {
    fn from(map: MapRef) -> Self {
        Value::Map(map)
    }
}

impl From<ListRef> for Value {
    fn from(list: ListRef) -> Self {
        Value::List(list)
    }
}

/// An opaque host-layer value carried through state without being observed.
pub struct HostObject {
    inner: Arc<dyn Any + Send + Sync>,
}

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// Identity comparison: two handles to the same host object.
    pub fn same(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Clone for HostObject {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Per-container instrumentation state shared by maps and lists.
pub(crate) struct ContainerMeta {
    pub(crate) observer: RwLock<Option<Observer>>,
    pub(crate) frozen: AtomicBool,
}

impl ContainerMeta {
    fn new() -> Self {
        Self {
            observer: RwLock::new(None),
            frozen: AtomicBool::new(false),
        }
    }
}

/// One map entry: the stored value plus the Dep tracking reads of this key.
pub(crate) struct Entry {
    pub(crate) value: Value,
    pub(crate) dep: Dep,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            dep: Dep::new(),
        }
    }
}

/// A shared keyed container. Keys iterate in insertion order.
pub struct MapRef {
    pub(crate) inner: Arc<MapInner>,
}

pub(crate) struct MapInner {
    pub(crate) entries: RwLock<IndexMap<String, Entry>>,
    pub(crate) meta: ContainerMeta,
}

impl MapRef {
    pub fn new() -> Self {
        Self::from_entries(std::iter::empty())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            inner: Arc::new(MapInner {
                entries: RwLock::new(
                    entries
                        .into_iter()
                        .map(|(key, value)| (key, Entry::new(value)))
                        .collect(),
                ),
                meta: ContainerMeta::new(),
            }),
        }
    }

    pub fn observer(&self) -> Option<Observer> {
        self.inner.meta.observer.read().clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.meta.frozen.load(Ordering::Relaxed)
    }

    /// Mark the container immutable. Frozen containers are never observed
    /// and refuse mutation.
    pub fn freeze(&self) {
        self.inner.meta.frozen.store(true, Ordering::Relaxed);
    }

    /// Read a key, registering the dependency edge when a watcher is
    /// evaluating and this map is observed. Missing keys read as `Null`.
    pub fn get(&self, key: &str) -> Value {
        let entries = self.inner.entries.read();
        let Some(entry) = entries.get(key) else {
            return Value::Null;
        };
        let value = entry.value.clone();
        let dep = entry.dep.clone();
        drop(entries);

        if self.observer().is_some() {
            dep.depend();
            if let Some(child_ob) = value.observer() {
                // Shape changes on the child (set/del of whole keys) notify
                // through its root Dep, so a read of the child registers it.
                child_ob.dep().depend();
                if let Value::List(list) = &value {
                    depend_list(list);
                }
            }
        }
        value
    }

    /// Write a key. Existing keys take the intercepted-write path: unchanged
    /// values (NaN equal to NaN) are a no-op, changed values are stored,
    /// re-observed, and notified through the key's Dep. Missing keys take the
    /// shape-add path: the entry is inserted and the root Dep notified, but
    /// adding keys to a container registered as root state is refused.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ReactiveError> {
        if self.is_frozen() {
            tracing::warn!(target: "filament", key, "set on a frozen container ignored");
            return Err(ReactiveError::Frozen);
        }
        let mut entries = self.inner.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            if entry.value.same(&value) {
                return Ok(());
            }
            entry.value = value.clone();
            let dep = entry.dep.clone();
            drop(entries);
            if self.observer().is_some() {
                // The new value may be a freshly introduced container.
                observe::observe(&value);
                dep.notify();
            }
            return Ok(());
        }
        drop(entries);
        self.insert_new(key, value)
    }

    fn insert_new(&self, key: &str, value: Value) -> Result<(), ReactiveError> {
        match self.observer() {
            Some(ob) => {
                if ob.is_root() {
                    tracing::warn!(
                        target: "filament",
                        key,
                        "avoid adding reactive keys to root state at runtime; declare them upfront"
                    );
                    return Err(ReactiveError::RootMutation(key.to_string()));
                }
                self.inner
                    .entries
                    .write()
                    .insert(key.to_string(), Entry::new(value.clone()));
                observe::observe(&value);
                ob.dep().notify();
                Ok(())
            }
            None => {
                self.inner
                    .entries
                    .write()
                    .insert(key.to_string(), Entry::new(value));
                Ok(())
            }
        }
    }

    /// Remove a key, notifying the root Dep. Absent keys are a no-op.
    /// Refused for containers registered as root state.
    pub fn remove(&self, key: &str) -> Result<Option<Value>, ReactiveError> {
        if self.is_frozen() {
            tracing::warn!(target: "filament", key, "remove on a frozen container ignored");
            return Err(ReactiveError::Frozen);
        }
        if let Some(ob) = self.observer() {
            if ob.is_root() {
                tracing::warn!(
                    target: "filament",
                    key,
                    "avoid deleting keys on root state at runtime; set the value to null instead"
                );
                return Err(ReactiveError::RootMutation(key.to_string()));
            }
        }
        let removed = self.inner.entries.write().shift_remove(key);
        let Some(entry) = removed else {
            return Ok(None);
        };
        if let Some(ob) = self.observer() {
            ob.dep().notify();
        }
        Ok(Some(entry.value))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let found = self.inner.entries.read().contains_key(key);
        self.depend_shape();
        found
    }

    /// The keys in insertion order. A shape read: registers the root Dep.
    pub fn keys(&self) -> Vec<String> {
        let keys = self.inner.entries.read().keys().cloned().collect();
        self.depend_shape();
        keys
    }

    pub fn len(&self) -> usize {
        let len = self.inner.entries.read().len();
        self.depend_shape();
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn depend_shape(&self) {
        if let Some(ob) = self.observer() {
            ob.dep().depend();
        }
    }
}

impl Default for MapRef {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MapRef {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for MapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapRef({})", Value::Map(self.clone()).to_json())
    }
}

/// A shared ordered container.
///
/// There are no per-index Deps; all mutation notifies through the container
/// root Dep, and the mutating operations below are the only entry points, so
/// index-based writes cannot bypass notification.
pub struct ListRef {
    pub(crate) inner: Arc<ListInner>,
}

pub(crate) struct ListInner {
    pub(crate) items: RwLock<Vec<Value>>,
    pub(crate) meta: ContainerMeta,
}

impl ListRef {
    pub fn new() -> Self {
        Self::from_values(Vec::new())
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        Self {
            inner: Arc::new(ListInner {
                items: RwLock::new(items),
                meta: ContainerMeta::new(),
            }),
        }
    }

    pub fn observer(&self) -> Option<Observer> {
        self.inner.meta.observer.read().clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.meta.frozen.load(Ordering::Relaxed)
    }

    pub fn freeze(&self) {
        self.inner.meta.frozen.store(true, Ordering::Relaxed);
    }

    /// Read one element; out-of-bounds reads as `Null`. Registers the root
    /// Dep (there are no per-index Deps) plus the element's own root Dep
    /// when the element is an observed container.
    pub fn get(&self, index: usize) -> Value {
        let value = self
            .inner
            .items
            .read()
            .get(index)
            .cloned()
            .unwrap_or(Value::Null);
        if self.observer().is_some() {
            self.depend_root();
            if let Some(child_ob) = value.observer() {
                child_ob.dep().depend();
                if let Value::List(list) = &value {
                    depend_list(list);
                }
            }
        }
        value
    }

    pub fn len(&self) -> usize {
        let len = self.inner.items.read().len();
        self.depend_root();
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot all elements. Registers the root Dep and every element's
    /// root Dep, recursively, since taking the whole list reads them all.
    pub fn to_vec(&self) -> Vec<Value> {
        let items = self.inner.items.read().clone();
        if self.observer().is_some() {
            self.depend_root();
            depend_list(self);
        }
        items
    }

    /// Append to the end.
    pub fn push(&self, value: Value) -> Result<(), ReactiveError> {
        self.mutate(|items| {
            items.push(value.clone());
            (vec![value.clone()], ())
        })
    }

    /// Remove from the end.
    pub fn pop(&self) -> Result<Option<Value>, ReactiveError> {
        self.mutate(|items| (Vec::new(), items.pop()))
    }

    /// Remove from the front.
    pub fn shift(&self) -> Result<Option<Value>, ReactiveError> {
        self.mutate(|items| {
            if items.is_empty() {
                (Vec::new(), None)
            } else {
                (Vec::new(), Some(items.remove(0)))
            }
        })
    }

    /// Insert at the front.
    pub fn unshift(&self, value: Value) -> Result<(), ReactiveError> {
        self.mutate(|items| {
            items.insert(0, value.clone());
            (vec![value.clone()], ())
        })
    }

    /// Remove `delete_count` elements starting at `start`, inserting `items`
    /// in their place. Returns the removed elements. Out-of-range arguments
    /// are clamped.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        inserted: Vec<Value>,
    ) -> Result<Vec<Value>, ReactiveError> {
        self.mutate(|items| {
            let start = start.min(items.len());
            let end = (start + delete_count).min(items.len());
            let removed: Vec<Value> = items.splice(start..end, inserted.iter().cloned()).collect();
            (inserted.clone(), removed)
        })
    }

    /// In-place sort with a caller-supplied ordering.
    pub fn sort_by(
        &self,
        mut compare: impl FnMut(&Value, &Value) -> std::cmp::Ordering,
    ) -> Result<(), ReactiveError> {
        self.mutate(|items| {
            items.sort_by(&mut compare);
            (Vec::new(), ())
        })
    }

    /// In-place reversal.
    pub fn reverse(&self) -> Result<(), ReactiveError> {
        self.mutate(|items| {
            items.reverse();
            (Vec::new(), ())
        })
    }

    /// Write one index, extending with `Null` when writing past the end.
    /// Routed through `splice`, so it notifies like any other list mutation.
    pub fn set(&self, index: usize, value: Value) -> Result<(), ReactiveError> {
        if self.is_frozen() {
            tracing::warn!(target: "filament", index, "set on a frozen container ignored");
            return Err(ReactiveError::Frozen);
        }
        {
            let mut items = self.inner.items.write();
            if index > items.len() {
                items.resize(index, Value::Null);
            }
        }
        self.splice(index, 1, vec![value]).map(|_| ())
    }

    /// Remove one index. Out-of-bounds is a no-op.
    pub fn remove(&self, index: usize) -> Result<Option<Value>, ReactiveError> {
        Ok(self.splice(index, 1, Vec::new())?.into_iter().next())
    }

    /// Shared mutator wrapper: perform the plain mutation, then observe
    /// inserted elements and notify the root Dep if this list is observed.
    fn mutate<R>(
        &self,
        op: impl FnOnce(&mut Vec<Value>) -> (Vec<Value>, R),
    ) -> Result<R, ReactiveError> {
        if self.is_frozen() {
            tracing::warn!(target: "filament", "mutation of a frozen container ignored");
            return Err(ReactiveError::Frozen);
        }
        let (inserted, result) = {
            let mut items = self.inner.items.write();
            op(&mut items)
        };
        if let Some(ob) = self.observer() {
            for value in &inserted {
                observe::observe(value);
            }
            ob.dep().notify();
        }
        Ok(result)
    }

    fn depend_root(&self) {
        if let Some(ob) = self.observer() {
            ob.dep().depend();
        }
    }
}

impl Default for ListRef {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ListRef {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ListRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListRef({})", Value::List(self.clone()).to_json())
    }
}

/// Register the root Dep of every observed element, recursively. Lists have
/// no per-index Deps, so element-level dependency is force-attached whenever
/// a list is read as a whole.
pub(crate) fn depend_list(list: &ListRef) {
    let items: Vec<Value> = list.inner.items.read().clone();
    for item in &items {
        if let Some(ob) = item.observer() {
            ob.dep().depend();
        }
        if let Value::List(nested) = item {
            depend_list(nested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sameness_treats_nan_as_equal() {
        assert!(Value::Float(f64::NAN).same(&Value::Float(f64::NAN)));
        assert!(Value::Float(1.5).same(&Value::Float(1.5)));
        assert!(!Value::Float(1.5).same(&Value::Float(2.5)));
        assert!(!Value::Int(1).same(&Value::Float(1.0)));
    }

    #[test]
    fn container_sameness_is_identity() {
        let a = MapRef::new();
        let b = a.clone();
        let c = MapRef::new();
        assert!(Value::Map(a.clone()).same(&Value::Map(b)));
        assert!(!Value::Map(a).same(&Value::Map(c)));
    }

    #[test]
    fn json_round_trip() {
        let json = json!({"a": {"b": 1}, "list": [1, "two", null], "flag": true});
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn map_reads_missing_keys_as_null() {
        let map = MapRef::new();
        assert!(map.get("missing").same(&Value::Null));
    }

    #[test]
    fn map_set_and_get_plain() {
        let map = MapRef::new();
        map.set("a", Value::Int(1)).unwrap();
        assert_eq!(map.get("a").as_i64(), Some(1));
        map.set("a", Value::Int(2)).unwrap();
        assert_eq!(map.get("a").as_i64(), Some(2));
        assert_eq!(map.keys(), vec!["a".to_string()]);
    }

    #[test]
    fn frozen_map_refuses_mutation() {
        let map = MapRef::from_entries([("a".to_string(), Value::Int(1))]);
        map.freeze();
        assert!(matches!(
            map.set("a", Value::Int(2)),
            Err(ReactiveError::Frozen)
        ));
        assert_eq!(map.get("a").as_i64(), Some(1));
    }

    #[test]
    fn list_mutators_have_plain_semantics() {
        let list = ListRef::from_values(vec![Value::Int(1), Value::Int(2)]);
        list.push(Value::Int(3)).unwrap();
        list.unshift(Value::Int(0)).unwrap();
        assert_eq!(
            Value::List(list.clone()).to_json(),
            serde_json::json!([0, 1, 2, 3])
        );

        assert_eq!(list.pop().unwrap().unwrap().as_i64(), Some(3));
        assert_eq!(list.shift().unwrap().unwrap().as_i64(), Some(0));

        let removed = list.splice(1, 1, vec![Value::Int(9), Value::Int(8)]).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].as_i64(), Some(2));
        assert_eq!(
            Value::List(list.clone()).to_json(),
            serde_json::json!([1, 9, 8])
        );

        list.reverse().unwrap();
        assert_eq!(
            Value::List(list.clone()).to_json(),
            serde_json::json!([8, 9, 1])
        );

        list.sort_by(|a, b| a.as_i64().cmp(&b.as_i64())).unwrap();
        assert_eq!(Value::List(list).to_json(), serde_json::json!([1, 8, 9]));
    }

    #[test]
    fn list_set_extends_with_null() {
        let list = ListRef::new();
        list.set(2, Value::Int(7)).unwrap();
        assert_eq!(Value::List(list).to_json(), serde_json::json!([null, null, 7]));
    }

    #[test]
    fn host_objects_compare_by_identity() {
        let a = HostObject::new(42u32);
        let b = a.clone();
        let c = HostObject::new(42u32);
        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert_eq!(a.downcast_ref::<u32>(), Some(&42));
    }
}
