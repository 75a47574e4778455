//! Watcher Implementation
//!
//! A watcher is one tracked computation: a getter evaluated over its scope's
//! root state, the set of Deps touched during that evaluation, and an
//! optional callback fired when the computed value changes.
//!
//! # Dependency reconciliation
//!
//! Each evaluation collects dependencies into a fresh generation
//! (`new_deps`). Afterwards, any Dep held last generation but untouched this
//! one has this watcher unsubscribed: a conditional read that stops being
//! reached must stop re-triggering. The two-level check in `add_dep` keeps
//! registration idempotent within a cycle and avoids re-registering Deps
//! that persist across cycles.
//!
//! # Flavors
//!
//! The [`WatcherOptions`] flags select behavior on notification: `lazy`
//! watchers only mark themselves dirty (memoized values, re-evaluated on the
//! next read); `sync` watchers re-run immediately; everything else hands
//! itself to the scheduler for batched, deduplicated, deferred execution.
//! `deep` watchers traverse their result to pick up nested dependencies, and
//! `user` watchers get an error boundary around their getter and callback.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::dep::{self, Dep, TargetGuard};
use super::scope::ScopeInner;
use super::traverse::traverse;
use super::value::Value;
use crate::error::{handle_error, ReactiveError};
use crate::scheduler;

/// Counter for generating unique watcher IDs. Creation order doubles as the
/// scheduler's total order, so parents (created first) run before children.
static WATCHER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_watcher_id() -> u64 {
    WATCHER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A getter evaluated against the owning scope's root state.
pub type GetterFn = Box<dyn Fn(&Value) -> Result<Value, ReactiveError> + Send + Sync>;

/// Change callback receiving (new value, old value).
pub type CallbackFn = Box<dyn Fn(&Value, &Value) -> Result<(), ReactiveError> + Send + Sync>;

/// Hook invoked by the scheduler just before a queued watcher re-runs.
pub type BeforeFn = Box<dyn Fn() + Send + Sync>;

/// Behavior flags for a watcher, fixed at construction.
#[derive(Default)]
pub struct WatcherOptions {
    /// Traverse the computed value to track nested dependencies.
    pub deep: bool,
    /// Registered through a user-facing watch API: getter and callback
    /// errors are reported, never propagated.
    pub user: bool,
    /// Memoized: notifications mark dirty instead of re-running; evaluation
    /// happens on the next read.
    pub lazy: bool,
    /// Re-run immediately on notification instead of batching.
    pub sync: bool,
    /// Pre-update hook called by the scheduler before each queued run.
    pub before: Option<BeforeFn>,
}

/// Handle to a tracked computation. Cloning shares the underlying watcher.
pub struct Watcher {
    pub(crate) inner: Arc<WatcherInner>,
}

pub(crate) struct WatcherInner {
    weak_self: Weak<WatcherInner>,
    id: u64,
    expression: String,
    getter: GetterFn,
    cb: Option<CallbackFn>,
    deep: bool,
    user: bool,
    lazy: bool,
    sync: bool,
    before: Option<BeforeFn>,
    active: AtomicBool,
    dirty: AtomicBool,
    value: RwLock<Value>,
    dep_sets: Mutex<DepSets>,
    scope: Weak<ScopeInner>,
}

/// Two generations of collected dependencies plus id sets for O(1)
/// membership checks.
#[derive(Default)]
struct DepSets {
    deps: Vec<Dep>,
    new_deps: Vec<Dep>,
    dep_ids: HashSet<u64>,
    new_dep_ids: HashSet<u64>,
}

impl Watcher {
    pub(crate) fn new(
        scope: &Arc<ScopeInner>,
        getter: GetterFn,
        expression: String,
        cb: Option<CallbackFn>,
        options: WatcherOptions,
    ) -> Result<Watcher, ReactiveError> {
        let WatcherOptions {
            deep,
            user,
            lazy,
            sync,
            before,
        } = options;
        let inner = Arc::new_cyclic(|weak_self| WatcherInner {
            weak_self: weak_self.clone(),
            id: next_watcher_id(),
            expression,
            getter,
            cb,
            deep,
            user,
            lazy,
            sync,
            before,
            active: AtomicBool::new(true),
            dirty: AtomicBool::new(lazy),
            value: RwLock::new(Value::Null),
            dep_sets: Mutex::new(DepSets::default()),
            scope: Arc::downgrade(scope),
        });
        let watcher = Watcher { inner };
        scope.register_watcher(&watcher);
        if !lazy {
            let initial = watcher.inner.get()?;
            *watcher.inner.value.write() = initial;
        }
        Ok(watcher)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether a lazy watcher has a pending invalidation.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Number of Deps this watcher is currently subscribed to.
    pub fn dep_count(&self) -> usize {
        self.inner.dep_sets.lock().deps.len()
    }

    /// Read the watcher's value.
    ///
    /// A dirty lazy watcher re-evaluates first; then, if another watcher is
    /// currently evaluating, this watcher's own dependencies are propagated
    /// to it. This is how a memoized value exposes its transitive
    /// dependencies to whoever reads it without re-running the computation.
    pub fn value(&self) -> Result<Value, ReactiveError> {
        if self.inner.lazy && self.inner.dirty.load(Ordering::Acquire) {
            self.inner.evaluate()?;
        }
        if dep::has_target() {
            self.inner.depend();
        }
        Ok(self.inner.value.read().clone())
    }

    /// Force evaluation of a lazy watcher and clear its dirty flag.
    pub fn evaluate(&self) -> Result<(), ReactiveError> {
        self.inner.evaluate()
    }

    /// Unsubscribe from every Dep and mark inactive. Idempotent.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    pub(crate) fn run(&self) {
        self.inner.run();
    }

    pub(crate) fn call_before(&self) {
        if let Some(before) = &self.inner.before {
            before();
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.inner.id)
            .field("expression", &self.inner.expression)
            .field("active", &self.is_active())
            .field("dep_count", &self.dep_count())
            .finish()
    }
}

impl WatcherInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Evaluate the getter with this watcher as the active target, then
    /// reconcile dependency generations.
    ///
    /// User-watcher getter failures are reported and yield `Null` for the
    /// cycle; internal watcher failures propagate, since suppressing them
    /// would hide a defect in the consuming layer's own code. Either way the
    /// target is popped and stale dependencies are pruned.
    fn get(&self) -> Result<Value, ReactiveError> {
        let Some(this) = self.weak_self.upgrade() else {
            return Ok(Value::Null);
        };
        let root = self
            .scope
            .upgrade()
            .map(|scope| scope.data())
            .unwrap_or(Value::Null);

        let guard = TargetGuard::push(this);
        let outcome = (self.getter)(&root);
        if let Ok(value) = &outcome {
            // Touch every nested property while still the active target.
            if self.deep {
                traverse(value);
            }
        }
        drop(guard);
        self.cleanup_deps();

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                if self.user {
                    handle_error(&err, &format!("getter for watcher \"{}\"", self.expression));
                    Ok(Value::Null)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Record a dependency collected during the current evaluation.
    ///
    /// Idempotent per cycle; only registers with the Dep when it was not
    /// held last cycle either.
    pub(crate) fn add_dep(&self, dep: &Dep) {
        let id = dep.id();
        let mut sets = self.dep_sets.lock();
        if !sets.new_dep_ids.contains(&id) {
            sets.new_dep_ids.insert(id);
            sets.new_deps.push(dep.clone());
            if !sets.dep_ids.contains(&id) {
                if let Some(this) = self.weak_self.upgrade() {
                    dep.add_sub(&this);
                }
            }
        }
    }

    /// Prune Deps read last cycle but not this one, then promote the new
    /// generation to baseline.
    fn cleanup_deps(&self) {
        let mut sets = self.dep_sets.lock();
        for stale in &sets.deps {
            if !sets.new_dep_ids.contains(&stale.id()) {
                stale.remove_sub(self.id);
            }
        }
        let DepSets {
            deps,
            new_deps,
            dep_ids,
            new_dep_ids,
        } = &mut *sets;
        std::mem::swap(deps, new_deps);
        std::mem::swap(dep_ids, new_dep_ids);
        new_deps.clear();
        new_dep_ids.clear();
    }

    /// Subscriber interface, called by a Dep on notify.
    pub(crate) fn update(&self) {
        if self.lazy {
            self.dirty.store(true, Ordering::Release);
        } else if self.sync {
            self.run();
        } else if let Some(this) = self.weak_self.upgrade() {
            scheduler::queue_watcher(Watcher { inner: this });
        }
    }

    /// Scheduler job interface: re-evaluate and fire the callback when the
    /// value changed. Containers fire even on identity-stable values, since
    /// their contents may have mutated; deep watchers always fire.
    pub(crate) fn run(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let new_value = match self.get() {
            Ok(value) => value,
            Err(err) => {
                handle_error(&err, &format!("getter for watcher \"{}\"", self.expression));
                return;
            }
        };
        let old_value = self.value.read().clone();
        if !new_value.same(&old_value) || new_value.is_container() || self.deep {
            *self.value.write() = new_value.clone();
            if let Some(cb) = &self.cb {
                if let Err(err) = cb(&new_value, &old_value) {
                    handle_error(
                        &err,
                        &format!("callback for watcher \"{}\"", self.expression),
                    );
                }
            }
        }
    }

    /// Lazy-watcher evaluation: recompute and clear the dirty flag.
    fn evaluate(&self) -> Result<(), ReactiveError> {
        let value = self.get()?;
        *self.value.write() = value;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Register every Dep this watcher holds with the currently active
    /// target.
    fn depend(&self) {
        let deps: Vec<Dep> = self.dep_sets.lock().deps.clone();
        for dep in deps {
            dep.depend();
        }
    }

    fn teardown(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        // Removing from the scope's list is O(n), so it is skipped when the
        // whole scope is being discarded at once.
        if let Some(scope) = self.scope.upgrade() {
            if !scope.is_tearing_down() {
                scope.unregister_watcher(self.id);
            }
        }
        let sets = {
            let mut guard = self.dep_sets.lock();
            std::mem::take(&mut *guard)
        };
        for dep in sets.deps {
            dep.remove_sub(self.id);
        }
    }
}

/// Parse a dot-delimited path expression into segments.
///
/// Only simple identifier paths are accepted (`\w`, `$`, separated by `.`);
/// anything else needs a getter function instead.
pub(crate) fn parse_path(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return None;
    }
    let valid = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.');
    if !valid {
        return None;
    }
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return None;
    }
    Some(segments)
}

/// Build a getter walking the parsed path, yielding `Null` for any segment
/// that cannot be reached.
pub(crate) fn path_getter(segments: Vec<String>) -> GetterFn {
    Box::new(move |root| {
        let mut current = root.clone();
        for segment in &segments {
            current = match &current {
                Value::Map(map) => map.get(segment),
                _ => return Ok(Value::Null),
            };
        }
        Ok(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_path_accepts_dotted_identifiers() {
        assert_eq!(
            parse_path("a.b.c"),
            Some(vec!["a".into(), "b".into(), "c".into()])
        );
        assert_eq!(parse_path("$data"), Some(vec!["$data".into()]));
        assert_eq!(parse_path("x_1"), Some(vec!["x_1".into()]));
    }

    #[test]
    fn parse_path_rejects_expressions() {
        assert_eq!(parse_path("a[0]"), None);
        assert_eq!(parse_path("a + b"), None);
        assert_eq!(parse_path(""), None);
        assert_eq!(parse_path("a..b"), None);
        assert_eq!(parse_path(".a"), None);
    }

    #[test]
    fn path_getter_walks_maps_and_defaults_to_null() {
        let root = Value::from_json(json!({"a": {"b": 5}}));
        let getter = path_getter(vec!["a".into(), "b".into()]);
        assert_eq!(getter(&root).unwrap().as_i64(), Some(5));

        let missing = path_getter(vec!["a".into(), "z".into(), "q".into()]);
        assert!(missing(&root).unwrap().same(&Value::Null));
    }

    #[test]
    fn watcher_ids_are_monotonic() {
        let a = next_watcher_id();
        let b = next_watcher_id();
        assert!(b > a);
    }
}
