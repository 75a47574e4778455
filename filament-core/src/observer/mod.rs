//! Dependency Tracking and Change Observation
//!
//! This module implements the tracking half of the reactive engine: the
//! observable value tree, the dependency cells that connect it to watchers,
//! and the watchers themselves.
//!
//! # Concepts
//!
//! ## Values
//!
//! State lives in a [`Value`] tree. Scalars are plain data; maps and lists
//! are shared handles ([`MapRef`], [`ListRef`]) whose reads and writes go
//! through methods, which is where tracking and notification hook in. A
//! tree becomes reactive when [`observe`] walks it and attaches an
//! [`Observer`] to every container.
//!
//! ## Deps
//!
//! A [`Dep`] is one observable slot: a map key, a container's shape, an
//! element set. Reading the slot inside a tracking context subscribes the
//! active watcher; writing it notifies every subscriber.
//!
//! ## Watchers
//!
//! A [`Watcher`] evaluates a getter under a tracking context, records
//! exactly the deps the evaluation touched, and re-runs when any of them
//! notify. Dependency sets are rebuilt from scratch on every evaluation, so
//! a branch not taken this time around costs nothing until it is taken
//! again.
//!
//! # Implementation Notes
//!
//! The tracking context is a thread-local stack of watcher handles. Reads
//! check for an active frame and register against it; nested evaluations
//! (a watcher reading a lazy computed watcher) push and pop frames so each
//! evaluation records only its own reads.

pub(crate) mod dep;
pub(crate) mod observe;
pub(crate) mod scope;
pub(crate) mod traverse;
pub(crate) mod value;
pub(crate) mod watcher;

pub use dep::Dep;
pub use observe::{del, observe, observe_root, set, ObserveGuard, Observer};
pub use scope::Scope;
pub use traverse::traverse;
pub use value::{HostObject, ListRef, MapRef, Value};
pub use watcher::{BeforeFn, CallbackFn, GetterFn, Watcher, WatcherOptions};
