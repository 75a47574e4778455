//! Update Scheduling
//!
//! Mutations notify watchers; this module decides *when* notified watchers
//! actually re-run. [`queue`] batches them into an ascending-id flush on
//! the next tick, and [`task`] supplies the tick itself: explicit micro and
//! macro lanes the host drains with [`run_until_idle`].
//!
//! The common host loop is: apply mutations, call [`run_until_idle`],
//! observe the post-flush state (e.g. via [`next_tick`] callbacks, which
//! run after the watcher flush scheduled before them).

mod queue;
mod task;

pub(crate) use queue::queue_watcher;
pub use queue::{is_async, set_async, MAX_UPDATE_COUNT};
pub use task::{
    next_tick, next_tick_signal, run_microtasks, run_until_idle, with_macro_task, TickSignal,
};
