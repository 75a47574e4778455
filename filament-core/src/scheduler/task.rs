//! Task-Deferral Primitive
//!
//! "Run this callback once, after the current synchronous execution
//! unwinds." A library crate has no ambient event loop, so deferral is
//! modeled as two explicit thread-local lanes the host drains at its tick
//! boundaries:
//!
//! - the **micro** lane, the default, drained completely before anything
//!   else each turn (microtask-equivalent);
//! - the **macro** lane, one job per turn with micro jobs drained in between
//!   (macrotask-equivalent), for callers whose effect must be observably
//!   separated from same-tick event dispatch. Selected per call by wrapping
//!   the enqueueing code in [`with_macro_task`].
//!
//! [`next_tick`] builds on the lanes: it batches callbacks and schedules a
//! single flush job per pending batch, so all callbacks registered within
//! one synchronous block run together, in registration order, on the next
//! turn, after any watcher flushing that was scheduled first.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::mpsc;

use crate::error::{handle_error, ReactiveError};

type Job = Box<dyn FnOnce()>;
type TickCallback = Box<dyn FnOnce() -> Result<(), ReactiveError>>;

struct Lanes {
    micro: VecDeque<Job>,
    macro_lane: VecDeque<Job>,
}

thread_local! {
    static LANES: RefCell<Lanes> = RefCell::new(Lanes {
        micro: VecDeque::new(),
        macro_lane: VecDeque::new(),
    });
    static CALLBACKS: RefCell<Vec<TickCallback>> = const { RefCell::new(Vec::new()) };
    static PENDING: Cell<bool> = const { Cell::new(false) };
    static USE_MACRO: Cell<bool> = const { Cell::new(false) };
}

fn defer(job: Job) {
    let use_macro = USE_MACRO.with(Cell::get);
    LANES.with(|lanes| {
        let mut lanes = lanes.borrow_mut();
        if use_macro {
            lanes.macro_lane.push_back(job);
        } else {
            lanes.micro.push_back(job);
        }
    });
}

/// Drain the pending callback batch.
///
/// The pending flag drops first, so callbacks registered while the batch
/// runs start a new batch on a fresh deferred job rather than extending
/// this one.
fn flush_callbacks() {
    PENDING.with(|pending| pending.set(false));
    let batch = CALLBACKS.with(|callbacks| std::mem::take(&mut *callbacks.borrow_mut()));
    for callback in batch {
        if let Err(err) = callback() {
            handle_error(&err, "next_tick callback");
        }
    }
}

/// Register a callback to run after the next flush of deferred work.
///
/// Callbacks run FIFO within one deferred turn. Errors are reported, never
/// propagated, so one failing callback cannot starve the rest of the batch.
pub fn next_tick(cb: impl FnOnce() -> Result<(), ReactiveError> + 'static) {
    CALLBACKS.with(|callbacks| callbacks.borrow_mut().push(Box::new(cb)));
    if !PENDING.with(Cell::get) {
        PENDING.with(|pending| pending.set(true));
        defer(Box::new(flush_callbacks));
    }
}

/// Completion handle for a tick registered without a callback. Resolves once
/// the tick's batch has run.
pub struct TickSignal {
    rx: mpsc::Receiver<()>,
}

impl TickSignal {
    /// Whether the tick has completed. Non-blocking.
    pub fn is_complete(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Block until the tick completes. Only meaningful when another thread
    /// is pumping the lanes; on the pumping thread itself, call
    /// [`run_until_idle`] first and then [`TickSignal::is_complete`].
    pub fn wait(self) {
        let _ = self.rx.recv();
    }
}

/// Register for completion of the next deferred turn without supplying a
/// callback.
pub fn next_tick_signal() -> TickSignal {
    let (tx, rx) = mpsc::channel();
    next_tick(move || {
        let _ = tx.send(());
        Ok(())
    });
    TickSignal { rx }
}

/// Run `f` with deferral forced onto the macro lane, restoring the previous
/// lane selection when done.
pub fn with_macro_task<R>(f: impl FnOnce() -> R) -> R {
    struct LaneGuard {
        previous: bool,
    }
    impl Drop for LaneGuard {
        fn drop(&mut self) {
            let previous = self.previous;
            USE_MACRO.with(|flag| flag.set(previous));
        }
    }
    let _guard = LaneGuard {
        previous: USE_MACRO.with(|flag| flag.replace(true)),
    };
    f()
}

/// Drain the micro lane completely, including jobs enqueued by jobs.
pub fn run_microtasks() {
    loop {
        let job = LANES.with(|lanes| lanes.borrow_mut().micro.pop_front());
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

/// Pump both lanes until empty: drain the micro lane, run one macro job,
/// repeat. This is the host's "advance to the next tick boundary".
pub fn run_until_idle() {
    loop {
        run_microtasks();
        let job = LANES.with(|lanes| lanes.borrow_mut().macro_lane.pop_front());
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn callbacks_run_fifo_on_the_next_turn() {
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = order.clone();
            next_tick(move || {
                order.borrow_mut().push(tag);
                Ok(())
            });
        }
        assert!(order.borrow().is_empty());

        run_until_idle();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn callbacks_registered_during_a_flush_run_in_a_later_batch() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let inner_order = order.clone();
        next_tick(move || {
            inner_order.borrow_mut().push("outer");
            let nested_order = inner_order.clone();
            next_tick(move || {
                nested_order.borrow_mut().push("inner");
                Ok(())
            });
            Ok(())
        });

        run_microtasks();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn macro_lane_runs_after_micro_lane() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let macro_order = order.clone();
        with_macro_task(|| {
            next_tick(move || {
                macro_order.borrow_mut().push("macro");
                Ok(())
            });
        });
        let micro_order = order.clone();
        next_tick(move || {
            micro_order.borrow_mut().push("micro");
            Ok(())
        });

        run_until_idle();
        assert_eq!(*order.borrow(), vec!["micro", "macro"]);
    }

    #[test]
    fn signal_resolves_after_the_tick() {
        let signal = next_tick_signal();
        assert!(!signal.is_complete());

        run_until_idle();
        assert!(signal.is_complete());
    }

    #[test]
    fn failing_callback_does_not_starve_the_batch() {
        let ran = Rc::new(Cell::new(false));

        next_tick(|| Err(ReactiveError::eval("deliberate failure")));
        let ran_flag = ran.clone();
        next_tick(move || {
            ran_flag.set(true);
            Ok(())
        });

        run_until_idle();
        assert!(ran.get());
    }
}
