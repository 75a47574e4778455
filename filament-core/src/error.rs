//! Error types and the error reporting path.
//!
//! Failures raised by user-supplied code (watch getters, watch callbacks,
//! deferred-tick callbacks) are isolated per watcher: they are routed through
//! [`handle_error`] with a context string and never propagate into the flush
//! loop. Failures from the engine's own internal watchers propagate to the
//! caller, since swallowing them would hide a defect in the consuming layer.

use thiserror::Error;

/// Errors produced while evaluating watchers or mutating observed state.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A user-supplied getter or callback reported a failure.
    #[error("{0}")]
    Eval(String),

    /// A watch expression was not a valid dot-delimited path.
    #[error("invalid watch path {0:?}: only dot-delimited identifier paths are supported")]
    InvalidPath(String),

    /// Attempted to add or remove a reactive key on a container registered
    /// as root state. Root state shape must be declared upfront.
    #[error("cannot change reactive keys ({0:?}) on a root state container at runtime")]
    RootMutation(String),

    /// Attempted to mutate a frozen container.
    #[error("container is frozen")]
    Frozen,
}

impl ReactiveError {
    /// Convenience constructor for user-code failures.
    pub fn eval(msg: impl Into<String>) -> Self {
        ReactiveError::Eval(msg.into())
    }
}

/// Report an error from user-supplied code without propagating it.
///
/// One failing watcher must not break the rest of the batch, so callers
/// report through here and continue. The context string identifies the
/// failure site, e.g. `getter for watcher "a.b"`.
pub fn handle_error(err: &ReactiveError, context: &str) {
    tracing::error!(target: "filament", %err, context, "error in reactive callback");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_error_carries_message() {
        let err = ReactiveError::eval("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn invalid_path_names_the_expression() {
        let err = ReactiveError::InvalidPath("a-b".to_string());
        assert!(err.to_string().contains("a-b"));
    }
}
