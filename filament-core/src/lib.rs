//! Filament Core
//!
//! This crate provides a fine-grained reactive dependency-tracking engine.
//! It implements:
//!
//! - An observable value tree (maps, lists, scalars) with per-slot
//!   dependency cells
//! - Watchers that discover their dependencies by running, with dependency
//!   sets rebuilt on every evaluation
//! - An asynchronous flush queue that batches and orders watcher re-runs
//! - A task-deferral layer with explicit micro/macro lanes and a
//!   `next_tick` batching API
//!
//! # Architecture
//!
//! The crate is organized into two main modules:
//!
//! - `observer`: the tracking half: values, deps, observers, watchers,
//!   and the scope that owns them
//! - `scheduler`: the timing half: the watcher flush queue and the
//!   deferred-task lanes it runs on
//!
//! # Example
//!
//! ```rust
//! use filament_core::{Scope, Value, scheduler};
//! use serde_json::json;
//!
//! let scope = Scope::new(Value::from_json(json!({ "count": 0 })));
//!
//! scope.watch("count", |new, old| {
//!     println!("count: {:?} -> {:?}", old, new);
//!     Ok(())
//! }, Default::default())?;
//!
//! let root = scope.data().as_map().unwrap();
//! root.set("count", Value::Int(5))?;
//!
//! // Nothing has run yet; watcher re-runs are batched.
//! scheduler::run_until_idle();
//! # Ok::<(), filament_core::ReactiveError>(())
//! ```

pub mod error;
pub mod observer;
pub mod scheduler;

pub use error::{handle_error, ReactiveError};
pub use observer::{
    del, observe, observe_root, set, traverse, Dep, HostObject, ListRef, MapRef, ObserveGuard,
    Observer, Scope, Value, Watcher, WatcherOptions,
};
pub use scheduler::{next_tick, next_tick_signal, run_until_idle, TickSignal};
