//! Error payloads produced by a [`Task`](crate::task::Task).
//!
//! The runtime treats a task's error payload as opaque except for a handful
//! of sentinel shapes it must itself synthesize (`closed`, `timeout`,
//! `child error: ...`, coroutine-misuse messages). Everything else raised
//! from user code is carried verbatim in [`TaskError::User`].

use std::fmt;
use std::rc::Rc;

/// The error type published in a [`Task`](crate::task::Task)'s result slot.
///
/// Shared via `Rc` rather than cloned structurally: a task's error may need
/// to be read by several observers at once (multiple `wait()`/`pwait()`
/// callers, a parent's pending-child-error slot, a `traceback()` walk), and
/// `anyhow::Error` itself is not `Clone`.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// Raised verbatim from user code running inside a task.
    ///
    /// Not tagged `#[source]`: `anyhow::Error` deliberately does not
    /// implement `std::error::Error` itself (to avoid a conflicting
    /// reflexive blanket impl with its own `From<E: Error>`), so thiserror
    /// has no `&dyn Error` to hand back through `Error::source` for this
    /// variant. Its `Display` output already carries the full chain.
    #[error("{0}")]
    User(anyhow::Error),

    /// Synthesized by [`Task::close`](crate::task::Task::close). Level-triggered:
    /// re-raised at every suspension point once the closing flag is set.
    #[error("closed")]
    Closed,

    /// Returned (not raised) by [`Task::pwait`](crate::task::Task::pwait) when the
    /// deadline elapses before the task completes. Does not mutate the task.
    #[error("timeout")]
    Timeout,

    /// Framing applied to a non-awaited child's error when it is surfaced at
    /// the parent's next suspension point.
    #[error("child error: {0}")]
    ChildError(Rc<TaskError>),

    /// Framing applied by the (out-of-core) `iter` helper; the core only
    /// needs to know the shape so it can be produced consistently.
    #[error("iter error[index:{index}]: {source}")]
    IterError { index: usize, source: Rc<TaskError> },

    /// A second `complete()` call on an already-completing/completed task.
    #[error("already completing or completed")]
    AlreadyCompleting,

    /// User code (or a misbehaving embedding) resumed or yielded a task's
    /// coroutine outside of the scheduler's own step loop.
    #[error("{0}")]
    CoroutineMisuse(&'static str),
}

impl TaskError {
    /// Builds a [`TaskError::User`] from any `std::error::Error`-compatible value.
    pub fn user<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        TaskError::User(err.into())
    }

    /// Builds a [`TaskError::User`] from a plain message, mirroring the
    /// common `error("some message")` shape used in the spec's scenarios.
    pub fn msg(msg: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        TaskError::User(anyhow::anyhow!(msg))
    }

    /// Wraps `self` in the `child error: ...` framing applied when a
    /// non-awaited child's error reaches its parent. A `closed` payload is
    /// passed through unframed (§7: "A `closed` payload from a
    /// closed-before-started dependency is not re-framed").
    pub fn framed_as_child_error(self: Rc<Self>) -> Rc<TaskError> {
        if matches!(*self, TaskError::Closed) {
            self
        } else {
            Rc::new(TaskError::ChildError(self))
        }
    }

    /// True for the level-triggered cancellation sentinel.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskError::Closed)
    }
}

/// Convenience alias used throughout the crate for fallible task bodies.
pub type TaskResult<T> = Result<T, Rc<TaskError>>;
