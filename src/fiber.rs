//! The stackful coroutine primitive the rest of the runtime is built on.
//!
//! This is the bottom half of component C2 ("Suspension primitive"): a bare
//! yield/resume bridge with no notion of markers, tasks, or scheduling.
//! [`suspension`](crate::suspension) layers the marker-discipline protocol
//! described in the data model on top of the two functions this module
//! exports: [`Fiber::resume`] and [`suspend`].
//!
//! ```text
//!                               --------------------------------
//! --------------------------    |                              |
//! |                        |    v                              |
//! |                  ----------------                          |
//! |             ---> |  Scheduler   |  <-----                  |
//! |    resumer  |    ----------------       |   resumer        |
//! |             |           ^                |                  |
//! |   --------------                                            |
//! |   |   Fiber    |  ---- suspend() yields back to resumer -----
//! |   --------------
//! |         ^
//! |         |  Fiber::resume(payload)
//! -----------
//! ```
//!
//! Only the scheduler's step loop ever calls [`Fiber::resume`] (data model
//! invariant 7: "No coroutine other than the Task's own scheduler path ever
//! calls resume on the Task's coroutine"); everything else happens through
//! `suspend`.

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::thread;

thread_local! {
    /// Payload ferried across the most recent context switch, in whichever
    /// direction it last traveled. Sound because exactly one fiber (or the
    /// OS thread itself, between switches) ever runs at a time, and a switch
    /// always happens immediately after the sender stores into this cell.
    static PAYLOAD: RefCell<Option<Box<dyn Any>>> = const { RefCell::new(None) };

    /// The context to switch back into from inside [`suspend`], set by
    /// whichever side performed the most recent resume into this fiber.
    static RESUMER: Cell<Option<Context>> = const { Cell::new(None) };
}

fn take_payload() -> Box<dyn Any> {
    PAYLOAD
        .with(|p| p.borrow_mut().take())
        .expect("fiber transfer payload missing (protocol violation)")
}

fn put_payload(payload: Box<dyn Any>) {
    PAYLOAD.with(|p| *p.borrow_mut() = Some(payload));
}

/// What happened as a result of a single [`Fiber::resume`] call.
pub enum FiberEvent {
    /// The fiber called [`suspend`], handing back `payload`.
    Yielded(Box<dyn Any>),
    /// The fiber's body returned (carrying its boxed result) or panicked.
    Finished(thread::Result<Box<dyn Any>>),
}

enum FiberOutcome {
    Yielded(Box<dyn Any>),
    Finished(thread::Result<Box<dyn Any>>),
}

struct FiberBody {
    f: Option<Box<dyn FnOnce() -> Box<dyn Any> + 'static>>,
}

/// A single stackful coroutine: an owned stack plus a saved register
/// context. Roughly the teacher crate's `Coroutine`, minus the `Mutex`-
/// guarded state field it carried for a multi-thread-capable design this
/// runtime does not need (the scheduler is single-threaded by design).
pub struct Fiber {
    context: Cell<Option<Context>>,
    _stack: ProtectedFixedSizeStack,
    finished: Cell<bool>,
    entry_ptr: Cell<Option<usize>>,
}

impl Fiber {
    /// Allocates a guarded stack and prepares a fiber to run `f`. The body
    /// does not start executing until the first call to [`Fiber::resume`].
    /// `f`'s return value is ferried back to the caller of the final
    /// [`Fiber::resume`] as [`FiberEvent::Finished`]'s payload — this is how
    /// a task's body hands its result back to the scheduler without a
    /// separately shared cell.
    pub fn spawn(f: impl FnOnce() -> Box<dyn Any> + 'static, stack_size: usize) -> Fiber {
        let stack = ProtectedFixedSizeStack::new(stack_size)
            .expect("failed to allocate a guarded fiber stack");

        let body = Box::new(FiberBody { f: Some(Box::new(f)) });
        let entry_ptr = Box::into_raw(body) as usize;

        // Safety: `stack` outlives `context`, which we store alongside it.
        let context = unsafe { Context::new(&stack, trampoline) };

        Fiber {
            context: Cell::new(Some(context)),
            _stack: stack,
            finished: Cell::new(false),
            entry_ptr: Cell::new(Some(entry_ptr)),
        }
    }

    /// True once the fiber's body has returned or panicked.
    pub fn finished(&self) -> bool {
        self.finished.get()
    }

    /// Switches execution onto the fiber, handing it `payload`. On the very
    /// first resume, `payload` is available to the fiber via whatever
    /// convention the caller and the fiber body agree on (the scheduler
    /// passes the task's prepared resume arguments here); `cortask`'s own
    /// task bodies ignore it, since their arguments are captured by the
    /// closure at `run()` time instead.
    ///
    /// Returns once the fiber yields (via [`suspend`]) or finishes.
    pub fn resume(&self, payload: Box<dyn Any>) -> FiberEvent {
        assert!(!self.finished.get(), "resumed an already-finished fiber");

        let context = self
            .context
            .take()
            .expect("fiber is already running (reentrant resume)");

        put_payload(payload);
        let data = self.entry_ptr.take().unwrap_or(0);
        let transfer = context.resume(data);
        self.context.set(Some(transfer.context));

        match *take_payload()
            .downcast::<FiberOutcome>()
            .unwrap_or_else(|_| unreachable!("fiber protocol violation: unexpected transfer payload"))
        {
            FiberOutcome::Yielded(payload) => FiberEvent::Yielded(payload),
            FiberOutcome::Finished(result) => {
                self.finished.set(true);
                FiberEvent::Finished(result)
            }
        }
    }
}

extern "C" fn trampoline(t: Transfer) -> ! {
    // Stash the context that resumed us, so `suspend` (and our own final
    // jump back on completion) know where to switch to.
    RESUMER.with(|r| r.set(Some(t.context)));

    // The very first resume passes the boxed entry point via the native
    // usize channel rather than the `PAYLOAD` slot, since the slot is
    // reserved for the resume/suspend ping-pong that starts afterward.
    let entry_ptr = t.data;
    // Safety: `entry_ptr` was produced by `Box::into_raw` in `Fiber::spawn`
    // and is resumed into exactly once.
    let mut body = unsafe { Box::from_raw(entry_ptr as *mut FiberBody) };
    let f = body
        .f
        .take()
        .expect("fiber entry point invoked more than once");

    let result = panic::catch_unwind(AssertUnwindSafe(f));

    // Report completion and jump back into the resumer. This call never
    // returns: the fiber's stack is never entered again after this point.
    put_payload(Box::new(FiberOutcome::Finished(result)));
    let resumer = RESUMER
        .with(|r| r.take())
        .expect("no resumer context to return control to");
    let _ = resumer.resume(0);
    unreachable!("resumed a fiber stack past its completion");
}

/// Suspends the currently-running fiber, handing `payload` to whoever last
/// called [`Fiber::resume`], and returns whatever payload is passed to the
/// *next* `resume` call.
///
/// # Panics
///
/// Panics if called from outside of a running fiber (i.e. not on a fiber's
/// own stack). This is the primitive hygiene boundary: everything above this
/// layer (see [`crate::suspension`]) additionally verifies that only the
/// scheduler, not arbitrary user code, performs the matching resume.
pub fn suspend(payload: Box<dyn Any>) -> Box<dyn Any> {
    let resumer = RESUMER
        .with(|r| r.take())
        .expect("suspend() called outside of a running fiber");

    put_payload(Box::new(FiberOutcome::Yielded(payload)));
    let transfer = resumer.resume(0);
    RESUMER.with(|r| r.set(Some(transfer.context)));

    take_payload()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_to_completion_without_suspending() {
        let ran = std::rc::Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let fiber = Fiber::spawn(
            move || {
                ran2.set(true);
                Box::new(7i32) as Box<dyn Any>
            },
            1024 * 1024,
        );

        match fiber.resume(Box::new(())) {
            FiberEvent::Finished(Ok(payload)) => {
                assert_eq!(*payload.downcast::<i32>().unwrap(), 7);
            }
            _ => panic!("expected immediate completion"),
        }
        assert!(ran.get());
        assert!(fiber.finished());
    }

    #[test]
    fn suspend_round_trips_a_payload() {
        let fiber = Fiber::spawn(
            || {
                let reply = suspend(Box::new(41i32));
                let n = *reply.downcast::<i32>().unwrap();
                assert_eq!(n, 42);
                Box::new(()) as Box<dyn Any>
            },
            1024 * 1024,
        );

        match fiber.resume(Box::new(())) {
            FiberEvent::Yielded(payload) => {
                let n = *payload.downcast::<i32>().unwrap();
                assert_eq!(n, 41);
            }
            FiberEvent::Finished(_) => panic!("expected a yield"),
        }

        match fiber.resume(Box::new(42i32)) {
            FiberEvent::Finished(Ok(_)) => {}
            _ => panic!("expected completion after second resume"),
        }
    }

    #[test]
    fn propagates_panics_to_the_resumer() {
        let fiber = Fiber::spawn(
            || {
                panic!("boom");
            },
            1024 * 1024,
        );

        match fiber.resume(Box::new(())) {
            FiberEvent::Finished(Err(_)) => {}
            _ => panic!("expected the panic to surface as Finished(Err(..))"),
        }
    }
}
