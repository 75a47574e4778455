//! Owning Scope
//!
//! A scope owns a root state tree and the watchers evaluated against it:
//! the render watcher, memoized (computed) watchers, and user watch
//! expressions. Tearing the scope down unsubscribes every watcher in one
//! pass; watchers notice the bulk teardown and skip the per-watcher list
//! removal that would otherwise make it quadratic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::observe::observe_root;
use super::value::Value;
use super::watcher::{
    parse_path, path_getter, BeforeFn, CallbackFn, GetterFn, Watcher, WatcherOptions,
};
use crate::error::ReactiveError;

/// Owner of a root state tree and its watchers.
pub struct Scope {
    inner: Arc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    data: Value,
    watchers: Mutex<Vec<Watcher>>,
    // 0 = no render watcher; real watcher ids start at 1.
    render_watcher_id: AtomicU64,
    tearing_down: AtomicBool,
}

impl Scope {
    /// Create a scope owning `data` as root state. The root is observed
    /// immediately; its shape is fixed from here on (adding or removing
    /// top-level keys at runtime is refused).
    pub fn new(data: Value) -> Self {
        observe_root(&data);
        Self {
            inner: Arc::new(ScopeInner {
                data,
                watchers: Mutex::new(Vec::new()),
                render_watcher_id: AtomicU64::new(0),
                tearing_down: AtomicBool::new(false),
            }),
        }
    }

    /// The root state tree.
    pub fn data(&self) -> Value {
        self.inner.data.clone()
    }

    /// Watch a dot-delimited path expression. The callback receives
    /// (new value, old value) once per flush in which the value changed.
    ///
    /// Watchers registered here are user watchers: getter and callback
    /// errors are reported through the error path, never propagated.
    pub fn watch(
        &self,
        path: &str,
        cb: impl Fn(&Value, &Value) -> Result<(), ReactiveError> + Send + Sync + 'static,
        options: WatcherOptions,
    ) -> Result<Watcher, ReactiveError> {
        let Some(segments) = parse_path(path) else {
            tracing::warn!(
                target: "filament",
                path,
                "failed watching path: only simple dot-delimited paths are supported; \
                 use a getter function for full control"
            );
            return Err(ReactiveError::InvalidPath(path.to_string()));
        };
        let options = WatcherOptions {
            user: true,
            ..options
        };
        Watcher::new(
            &self.inner,
            path_getter(segments),
            path.to_string(),
            Some(Box::new(cb) as CallbackFn),
            options,
        )
    }

    /// Watch an arbitrary getter function evaluated against the root state.
    pub fn watch_fn(
        &self,
        getter: impl Fn(&Value) -> Result<Value, ReactiveError> + Send + Sync + 'static,
        cb: impl Fn(&Value, &Value) -> Result<(), ReactiveError> + Send + Sync + 'static,
        options: WatcherOptions,
    ) -> Result<Watcher, ReactiveError> {
        Watcher::new(
            &self.inner,
            Box::new(getter) as GetterFn,
            "<function>".to_string(),
            Some(Box::new(cb) as CallbackFn),
            options,
        )
    }

    /// Create a memoized (lazy) watcher: evaluated on demand, marked dirty
    /// by notifications. Read it with [`Watcher::value`].
    pub fn computed(
        &self,
        getter: impl Fn(&Value) -> Result<Value, ReactiveError> + Send + Sync + 'static,
    ) -> Result<Watcher, ReactiveError> {
        Watcher::new(
            &self.inner,
            Box::new(getter) as GetterFn,
            "<computed>".to_string(),
            None,
            WatcherOptions {
                lazy: true,
                ..WatcherOptions::default()
            },
        )
    }

    /// Create the scope's render watcher: an internal watcher whose id is
    /// cached for external lookup. Getter errors propagate to the caller.
    pub fn render(
        &self,
        getter: impl Fn(&Value) -> Result<Value, ReactiveError> + Send + Sync + 'static,
        before: Option<BeforeFn>,
    ) -> Result<Watcher, ReactiveError> {
        let watcher = Watcher::new(
            &self.inner,
            Box::new(getter) as GetterFn,
            "<render>".to_string(),
            None,
            WatcherOptions {
                before,
                ..WatcherOptions::default()
            },
        )?;
        self.inner
            .render_watcher_id
            .store(watcher.id(), Ordering::Release);
        Ok(watcher)
    }

    /// The id of this scope's render watcher, if one was created.
    pub fn render_watcher_id(&self) -> Option<u64> {
        match self.inner.render_watcher_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Number of live watchers owned by this scope.
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }

    /// Tear down every watcher owned by this scope and release the root
    /// claim on its data, so the tree can be re-rooted or reshaped by a
    /// later owner. Idempotent.
    pub fn teardown(&self) {
        if self.inner.tearing_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let watchers = std::mem::take(&mut *self.inner.watchers.lock());
        for watcher in &watchers {
            watcher.teardown();
        }
        self.inner.render_watcher_id.store(0, Ordering::Release);
        if let Some(ob) = self.inner.data.observer() {
            ob.release_root();
        }
    }
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("watcher_count", &self.watcher_count())
            .field("render_watcher_id", &self.render_watcher_id())
            .finish()
    }
}

impl ScopeInner {
    pub(crate) fn data(&self) -> Value {
        self.data.clone()
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::Acquire)
    }

    pub(crate) fn register_watcher(&self, watcher: &Watcher) {
        self.watchers.lock().push(watcher.clone());
    }

    pub(crate) fn unregister_watcher(&self, id: u64) {
        self.watchers.lock().retain(|watcher| watcher.id() != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with(json: serde_json::Value) -> Scope {
        Scope::new(Value::from_json(json))
    }

    #[test]
    fn scope_observes_its_root_data() {
        let scope = scope_with(json!({"a": 1}));
        let ob = scope.data().observer().unwrap();
        assert!(ob.is_root());
    }

    #[test]
    fn watch_rejects_invalid_paths() {
        let scope = scope_with(json!({"a": 1}));
        let result = scope.watch("a[0]", |_, _| Ok(()), WatcherOptions::default());
        assert!(matches!(result, Err(ReactiveError::InvalidPath(_))));
    }

    #[test]
    fn watchers_register_with_their_scope() {
        let scope = scope_with(json!({"a": 1}));
        let watcher = scope
            .watch("a", |_, _| Ok(()), WatcherOptions::default())
            .unwrap();
        assert_eq!(scope.watcher_count(), 1);

        watcher.teardown();
        assert_eq!(scope.watcher_count(), 0);
    }

    #[test]
    fn render_watcher_id_is_cached() {
        let scope = scope_with(json!({"a": 1}));
        assert_eq!(scope.render_watcher_id(), None);

        let watcher = scope
            .render(|root| Ok(root.as_map().unwrap().get("a")), None)
            .unwrap();
        assert_eq!(scope.render_watcher_id(), Some(watcher.id()));
    }

    #[test]
    fn teardown_is_idempotent_and_deactivates_watchers() {
        let scope = scope_with(json!({"a": 1}));
        let w1 = scope
            .watch("a", |_, _| Ok(()), WatcherOptions::default())
            .unwrap();
        let w2 = scope
            .watch("a", |_, _| Ok(()), WatcherOptions::default())
            .unwrap();

        scope.teardown();
        scope.teardown();

        assert!(!w1.is_active());
        assert!(!w2.is_active());
        assert_eq!(scope.watcher_count(), 0);
        assert_eq!(w1.dep_count(), 0);
        assert_eq!(w2.dep_count(), 0);
    }

    #[test]
    fn teardown_releases_the_root_claim() {
        let data = Value::from_json(json!({"a": 1}));
        let scope = Scope::new(data.clone());
        let map = data.as_map().unwrap();
        assert!(data.observer().unwrap().is_root());
        assert!(map.set("extra", Value::Int(1)).is_err());

        scope.teardown();
        assert!(!data.observer().unwrap().is_root());
        assert!(map.set("extra", Value::Int(1)).is_ok());
    }
}
