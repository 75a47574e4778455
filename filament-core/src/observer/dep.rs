//! Dependency Registry
//!
//! A [`Dep`] is a publish node: it sits between one piece of observed state
//! and the watchers that read it. Reading the state while a watcher is
//! evaluating registers an edge; writing the state notifies every subscribed
//! watcher.
//!
//! # The target stack
//!
//! Dependency discovery relies on knowing which watcher is currently
//! evaluating. Only one watcher can be evaluating at any moment on a given
//! thread, so the current target lives in a thread-local stack: nested
//! evaluations (a lazy watcher read during another watcher's getter) push and
//! pop, restoring the outer watcher when the inner one finishes. The pop
//! happens in a guard's `Drop` impl so the stack survives early unwinds.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use smallvec::SmallVec;

use super::watcher::WatcherInner;
use crate::scheduler;

/// Counter for generating unique dep IDs.
static DEP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_dep_id() -> u64 {
    DEP_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// One subscription edge. The watcher handle is weak so a Dep never keeps a
/// torn-down watcher alive.
struct Sub {
    id: u64,
    watcher: Weak<WatcherInner>,
}

/// A publish node linking observed state to its subscribed watchers.
///
/// Cloning a `Dep` produces another handle to the same node.
pub struct Dep {
    inner: Arc<DepInner>,
}

struct DepInner {
    id: u64,
    subs: RwLock<SmallVec<[Sub; 4]>>,
}

impl Dep {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(DepInner {
                id: next_dep_id(),
                subs: RwLock::new(SmallVec::new()),
            }),
        }
    }

    /// Get the dep's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Append a watcher to the subscriber list.
    ///
    /// No duplicate check here: the watcher's own per-cycle bookkeeping
    /// guarantees it registers with a given Dep at most once per evaluation.
    pub(crate) fn add_sub(&self, watcher: &Arc<WatcherInner>) {
        self.inner.subs.write().push(Sub {
            id: watcher.id(),
            watcher: Arc::downgrade(watcher),
        });
    }

    /// Remove a watcher by id. No-op if absent.
    pub(crate) fn remove_sub(&self, watcher_id: u64) {
        self.inner.subs.write().retain(|sub| sub.id != watcher_id);
    }

    /// Register this Dep with the currently evaluating watcher, if any.
    ///
    /// Registration is symmetric: the watcher records the Dep and, unless it
    /// already held it last cycle, the Dep records the watcher.
    pub fn depend(&self) {
        if let Some(target) = current_target() {
            target.add_dep(self);
        }
    }

    /// Notify every subscribed watcher that the underlying state changed.
    ///
    /// The subscriber list is snapshotted first so subscribers may mutate it
    /// mid-iteration (teardown, re-registration). Subscribers whose watcher
    /// has been dropped are pruned from the list while snapshotting. In
    /// synchronous mode the scheduler never sorts, so the snapshot is sorted
    /// by watcher id here to keep evaluation order deterministic.
    pub(crate) fn notify(&self) {
        let mut watchers: Vec<(u64, Arc<WatcherInner>)> = Vec::new();
        self.inner.subs.write().retain(|sub| match sub.watcher.upgrade() {
            Some(watcher) => {
                watchers.push((sub.id, watcher));
                true
            }
            None => false,
        });
        if !scheduler::is_async() {
            watchers.sort_by_key(|(id, _)| *id);
        }
        tracing::trace!(target: "filament", dep = self.inner.id, subscribers = watchers.len(), "notify");
        for (_, watcher) in watchers {
            watcher.update();
        }
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.read().len()
    }
}

impl Clone for Dep {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Dep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dep")
            .field("id", &self.inner.id)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// The watcher currently being evaluated on this thread. Globally unique per
// thread because only one watcher can be evaluating at a time.
thread_local! {
    static TARGET_STACK: RefCell<Vec<Arc<WatcherInner>>> = const { RefCell::new(Vec::new()) };
}

/// Get the currently evaluating watcher, if any.
pub(crate) fn current_target() -> Option<Arc<WatcherInner>> {
    TARGET_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Check whether any watcher is currently evaluating on this thread.
pub(crate) fn has_target() -> bool {
    TARGET_STACK.with(|stack| !stack.borrow().is_empty())
}

/// Guard that keeps a watcher on the target stack for the duration of one
/// evaluation. Popped on drop, so nested evaluations restore the outer
/// target even if the getter bails early.
pub(crate) struct TargetGuard {
    watcher_id: u64,
}

impl TargetGuard {
    pub(crate) fn push(watcher: Arc<WatcherInner>) -> Self {
        let watcher_id = watcher.id();
        TARGET_STACK.with(|stack| stack.borrow_mut().push(watcher));
        Self { watcher_id }
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        TARGET_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(watcher) = popped {
                debug_assert_eq!(
                    watcher.id(),
                    self.watcher_id,
                    "target stack mismatch: expected watcher {}, got {}",
                    self.watcher_id,
                    watcher.id()
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dep_ids_are_unique() {
        let d1 = Dep::new();
        let d2 = Dep::new();
        let d3 = Dep::new();

        assert_ne!(d1.id(), d2.id());
        assert_ne!(d2.id(), d3.id());
        assert_ne!(d1.id(), d3.id());
    }

    #[test]
    fn clone_shares_the_subscriber_list() {
        let d1 = Dep::new();
        let d2 = d1.clone();
        assert_eq!(d1.id(), d2.id());
        assert_eq!(d1.subscriber_count(), 0);
        assert_eq!(d2.subscriber_count(), 0);
    }

    #[test]
    fn no_target_outside_evaluation() {
        assert!(!has_target());
        assert!(current_target().is_none());
    }

    #[test]
    fn depend_without_target_is_a_noop() {
        let dep = Dep::new();
        dep.depend();
        assert_eq!(dep.subscriber_count(), 0);
    }

    #[test]
    fn notify_prunes_dropped_subscribers() {
        use crate::observer::scope::Scope;
        use crate::observer::value::Value;

        let dep = Dep::new();
        {
            let scope = Scope::new(Value::from_json(serde_json::json!({})));
            let watcher = scope
                .watch_fn(|_| Ok(Value::Null), |_, _| Ok(()), Default::default())
                .unwrap();
            dep.add_sub(&watcher.inner);
            assert_eq!(dep.subscriber_count(), 1);
        }
        // Scope and watcher handle are gone; the weak edge is dead.
        dep.notify();
        assert_eq!(dep.subscriber_count(), 0);
    }
}
