//! Component C1: the closable handle protocol.
//!
//! A `Closable` is the abstraction the runtime uses to cancel whatever
//! external, callback-style operation a task is currently awaiting (see
//! `current-await` in the data model). The runtime holds at most one per
//! task at a time, and only while that operation is outstanding.

use std::fmt;

/// A cancellable external resource.
///
/// Implementors must tolerate `close` being skipped entirely (if the handle
/// is consumed by its natural completion first) and must tolerate being
/// asked about `is_closing` at any point in their lifetime.
pub trait Closable {
    /// Requests cancellation. Must not block. `on_closed` must eventually be
    /// invoked exactly once, whether or not the handle was already closing;
    /// implementations that cannot detect "already closing" on their own
    /// should rely on the runtime never calling `close` twice on the same
    /// handle (see [`is_closing`](Closable::is_closing)).
    fn close(&mut self, on_closed: Box<dyn FnOnce()>);

    /// Reports whether a close is already in flight. The runtime treats a
    /// missing/default implementation as always-`false`, per the external
    /// interface contract ("the runtime treats missing `is_closing` as
    /// always-false").
    fn is_closing(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn Closable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closable { .. }")
    }
}

/// The boxed form stored as a task's current-await when it is a closable
/// handle rather than a child task.
pub type BoxClosable = Box<dyn Closable>;

impl Closable for BoxClosable {
    fn close(&mut self, on_closed: Box<dyn FnOnce()>) {
        (**self).close(on_closed);
    }

    fn is_closing(&self) -> bool {
        (**self).is_closing()
    }
}

/// A `Closable` that is also able to report whether its callback fired more
/// than once would be a bug on the caller's part; this helper wraps an
/// arbitrary `close` implementation so it is safe to call `close` again
/// without double-invoking `on_closed` — used internally by the scheduler
/// so a builder returning an already-closing handle is tolerated (§5:
/// "Reentrancy hazards").
pub(crate) struct OnceGuardedClosable<C: Closable> {
    inner: C,
    closed: bool,
}

impl<C: Closable> OnceGuardedClosable<C> {
    pub(crate) fn new(inner: C) -> Self {
        OnceGuardedClosable {
            inner,
            closed: false,
        }
    }
}

impl<C: Closable> Closable for OnceGuardedClosable<C> {
    fn close(&mut self, on_closed: Box<dyn FnOnce()>) {
        if self.closed || self.inner.is_closing() {
            // Don't double-close the inner handle, but the caller's
            // on_closed still must fire eventually (§5: "no handle leaks
            // across task completion"). We have no hook into whichever
            // close already in flight, so fire immediately rather than
            // leave the caller waiting forever.
            on_closed();
            return;
        }
        self.closed = true;
        self.inner.close(on_closed);
    }

    fn is_closing(&self) -> bool {
        self.closed || self.inner.is_closing()
    }
}
