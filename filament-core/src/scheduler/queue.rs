//! Watcher Flush Queue
//!
//! Batches watcher re-evaluation so a burst of same-tick mutations costs
//! each dirty watcher one run, not one run per mutation.
//!
//! # How a Flush Works
//!
//! Queued watchers are deduplicated by id, sorted ascending, then run under
//! a live cursor. Ascending order means a parent render watcher runs before
//! its children's, and a computed watcher created earlier runs before a
//! plain watcher created later that reads it. Watchers queued *during* the
//! flush are handled by where they land relative to the cursor:
//!
//! - at or ahead of the cursor's id: spliced, still sorted, into the
//!   unprocessed tail of this flush;
//! - strictly behind the cursor: already ran this flush, so re-running it
//!   now would break the ordering guarantee; it is parked and re-queued
//!   for the next flush instead.
//!
//! A watcher that keeps re-queueing itself trips a per-flush counter at
//! [`MAX_UPDATE_COUNT`]; it is then skipped for the remainder of that flush
//! (with a warning) while every other watcher keeps flushing normally.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use tracing::warn;

use super::task;
use crate::observer::watcher::Watcher;

/// How many times one watcher may run within a single flush before it is
/// treated as a runaway and skipped.
pub const MAX_UPDATE_COUNT: u32 = 100;

struct SchedulerState {
    queue: Vec<Watcher>,
    /// Watchers queued mid-flush whose id is already behind the cursor;
    /// they roll over to the next flush.
    deferred: Vec<Watcher>,
    has: HashSet<u64>,
    circular: HashMap<u64, u32>,
    waiting: bool,
    flushing: bool,
    index: usize,
}

thread_local! {
    static SCHEDULER: RefCell<SchedulerState> = RefCell::new(SchedulerState {
        queue: Vec::new(),
        deferred: Vec::new(),
        has: HashSet::new(),
        circular: HashMap::new(),
        waiting: false,
        flushing: false,
        index: 0,
    });
    static ASYNC_MODE: Cell<bool> = const { Cell::new(true) };
}

/// Toggle asynchronous batching for the current thread.
///
/// With batching off, every queued watcher flushes immediately and
/// synchronously inside the mutation that notified it. Intended for tests
/// that want assertions without pumping the task lanes.
pub fn set_async(enabled: bool) {
    ASYNC_MODE.with(|mode| mode.set(enabled));
}

/// Whether asynchronous batching is on for the current thread.
pub fn is_async() -> bool {
    ASYNC_MODE.with(Cell::get)
}

/// Queue a watcher for the next flush, deduplicating by id.
pub(crate) fn queue_watcher(watcher: Watcher) {
    let id = watcher.id();
    let mut needs_flush = false;
    SCHEDULER.with(|cell| {
        let mut state = cell.borrow_mut();
        if state.has.contains(&id) {
            return;
        }
        state.has.insert(id);
        if !state.flushing {
            state.queue.push(watcher);
        } else {
            let cursor_id = state.queue[state.index].id();
            if id >= cursor_id {
                // Sorted insert into the unprocessed tail. An id equal to
                // the cursor's is the cursor watcher re-queueing itself; it
                // lands immediately after and runs again this flush.
                let mut at = state.queue.len();
                while at > state.index + 1 && state.queue[at - 1].id() > id {
                    at -= 1;
                }
                state.queue.insert(at, watcher);
            } else {
                state.deferred.push(watcher);
            }
        }
        if !state.waiting {
            state.waiting = true;
            needs_flush = true;
        }
    });
    if needs_flush {
        if !is_async() {
            flush_queue();
            return;
        }
        task::next_tick(|| {
            flush_queue();
            Ok(())
        });
    }
}

fn flush_queue() {
    SCHEDULER.with(|cell| {
        let mut state = cell.borrow_mut();
        state.flushing = true;
        state.queue.sort_by_key(Watcher::id);
        tracing::trace!(target: "filament", queued = state.queue.len(), "flush start");
    });

    // The queue can grow while we iterate, so length is re-checked every
    // step and no borrow is held across a watcher run.
    loop {
        let next = SCHEDULER.with(|cell| {
            let state = cell.borrow();
            state.queue.get(state.index).cloned()
        });
        let Some(watcher) = next else { break };
        let id = watcher.id();
        watcher.call_before();
        let within_limit = SCHEDULER.with(|cell| {
            let mut state = cell.borrow_mut();
            state.has.remove(&id);
            let count = state.circular.entry(id).or_insert(0);
            *count += 1;
            *count <= MAX_UPDATE_COUNT
        });
        if within_limit {
            watcher.run();
        } else {
            warn!(
                target: "filament",
                watcher = id,
                expression = watcher.expression(),
                "possible infinite update loop; watcher skipped for the rest of this flush"
            );
        }
        SCHEDULER.with(|cell| cell.borrow_mut().index += 1);
    }

    let deferred = SCHEDULER.with(|cell| {
        let mut state = cell.borrow_mut();
        state.queue.clear();
        state.has.clear();
        state.circular.clear();
        state.index = 0;
        state.flushing = false;
        state.waiting = false;
        std::mem::take(&mut state.deferred)
    });
    for watcher in deferred {
        queue_watcher(watcher);
    }
}
