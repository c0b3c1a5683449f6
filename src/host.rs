//! Component C6: the host loop seam.
//!
//! The runtime is driven by something outside of itself — an event loop, a
//! game's per-frame tick, a test harness polling in a spin loop. Rather than
//! thread a host parameter through every public call (`run`, `await_*`,
//! `wait`), the current host loop lives in a thread-local slot, in the
//! spirit of the "currently running task" accessor described for the
//! scheduler (§9: module-scoped runtime state rather than a parameter
//! threaded everywhere). A process that never calls
//! [`set_host_loop`] gets a serviceable default: [`SimpleHostLoop`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// What the scheduler needs from whatever is driving it.
pub trait HostLoop {
    /// Schedules `work` to run on a future tick, never synchronously from
    /// within this call. Used by user-authored callback-style builders that
    /// want their completion deferred to the host rather than resolved
    /// synchronously inside the builder call.
    fn schedule_on_next_tick(&self, work: Box<dyn FnOnce()>);

    /// Pumps the host loop until `done` reports true or `timeout` elapses
    /// (if given). Used by [`Task::wait`](crate::task::Task::wait) and
    /// [`Task::pwait`](crate::task::Task::pwait) to drive a task to
    /// completion from ordinary (non-task) code.
    fn block_until(&self, done: &mut dyn FnMut() -> bool, timeout: Option<Duration>) -> bool;
}

/// A minimal `HostLoop`: a FIFO of deferred work, pumped by spinning until
/// either the predicate passes or the queue is empty and it never will.
///
/// Good enough to drive the test suite and to embed cortask in a process
/// with no event loop of its own; a real host (a GUI's frame loop, an
/// io_uring reactor) would implement [`HostLoop`] directly instead.
#[derive(Default)]
pub struct SimpleHostLoop {
    queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl SimpleHostLoop {
    pub fn new() -> Self {
        SimpleHostLoop {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    fn pump_one(&self) -> bool {
        let next = self.queue.borrow_mut().pop_front();
        match next {
            Some(work) => {
                work();
                true
            }
            None => false,
        }
    }
}

impl HostLoop for SimpleHostLoop {
    fn schedule_on_next_tick(&self, work: Box<dyn FnOnce()>) {
        self.queue.borrow_mut().push_back(work);
    }

    fn block_until(&self, done: &mut dyn FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if done() {
                return true;
            }
            if !self.pump_one() {
                // Nothing left to pump and the predicate still hasn't
                // passed: whatever we're waiting on depends on a resumption
                // that was never queued (an external callback that has yet
                // to fire). Yield to the OS briefly rather than spin the CPU.
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return done();
                    }
                }
                std::thread::yield_now();
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return done();
                }
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Rc<dyn HostLoop>> = RefCell::new(Rc::new(SimpleHostLoop::new()));
}

/// Installs `host` as the current thread's host loop, replacing whichever
/// default or previously-installed one was active.
pub fn set_host_loop(host: Rc<dyn HostLoop>) {
    CURRENT.with(|c| *c.borrow_mut() = host);
}

/// The current thread's host loop (a lazily-created [`SimpleHostLoop`] if
/// none was installed).
pub fn current() -> Rc<dyn HostLoop> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Convenience wrapper around `current().schedule_on_next_tick(..)`, for
/// user-authored callback-style builders (timers, I/O adapters) that want
/// to defer their own completion to the next host tick rather than
/// resolving the task synchronously.
pub fn schedule_on_next_tick(work: Box<dyn FnOnce()>) {
    current().schedule_on_next_tick(work);
}

/// Drives the current host loop until `done` passes or `timeout` elapses.
pub(crate) fn block_until(mut done: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
    current().block_until(&mut done, timeout)
}
