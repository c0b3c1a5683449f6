//! Component C7: the public entry points — spawning a task, the three await
//! shapes, and the `is_closing` ambient query.
//!
//! The original `await(task)` / `await(fn)` / `await(argc, fn, args…)`
//! overload set is realized as three differently-named free functions
//! (`await_task`, `await_fn`, `await_callback`) rather than one overloaded
//! `await`, since Rust has no argument-kind-based overloading; `argc`
//! positioning is moot once the continuation is an ordinary closure
//! argument rather than a slot in a variadic argument list.

use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::closable::BoxClosable;
use crate::error::TaskError;
use crate::options::Options;
use crate::scheduler::{AwaitRequest, Reply};
use crate::suspension;
use crate::task::{AnyTask, Task};

/// The continuation a callback-style builder used with [`await_fn`],
/// [`await_callback`], or [`wrap`] must invoke exactly once, in success or
/// failure.
pub type Continuation<R> = Box<dyn FnOnce(Result<R, Rc<TaskError>>)>;

/// Spawns `body` as a new task with default [`Options`]. Linked as a child
/// of whichever task is currently running, or as a root task if called
/// from outside any task.
#[track_caller]
pub fn run<T, F>(body: F) -> Task<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Result<T, Rc<TaskError>> + 'static,
{
    run_opts(Options::default(), body)
}

/// As [`run`], with explicit [`Options`] (name, stack size).
#[track_caller]
pub fn run_opts<T, F>(opts: Options, body: F) -> Task<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Result<T, Rc<TaskError>> + 'static,
{
    let task = Task::new(opts, body);
    link_to_current_parent(&task);
    crate::scheduler::start(task.inner.clone());
    task
}

fn link_to_current_parent<T: Clone + 'static>(task: &Task<T>) {
    if let Some(parent) = crate::scheduler::current_task() {
        let child: Rc<dyn AnyTask> = task.inner.clone() as Rc<dyn AnyTask>;
        task.inner.set_parent(Rc::downgrade(&parent));
        parent.add_child(child);
    }
}

/// Suspends the current task until `child` reaches `Completed`, returning
/// its result. `child`'s error, if any, surfaces verbatim — framing as a
/// "child error" applies only to a non-awaited child's error buffered
/// through the pending-child-error slot, not to an explicit await.
pub fn await_task<U: Clone + 'static>(child: &Task<U>) -> Result<U, Rc<TaskError>> {
    let child_dyn: Rc<dyn AnyTask> = child.inner.clone() as Rc<dyn AnyTask>;
    let child_for_result = child.inner.clone();

    let request = AwaitRequest::Task {
        child: child_dyn,
        register: Box::new(move |resume_cb| {
            let child_for_notifier = child_for_result.clone();
            child_for_result.add_notifier(Box::new(move || {
                let result = child_for_notifier
                    .result
                    .borrow()
                    .clone()
                    .expect("notifier fires only once the child has completed");
                resume_cb.fire(Reply::Value(Box::new(result)));
            }));
        }),
    };

    let reply = suspension::yield_suspend::<AwaitRequest, Reply>(request).map_err(Rc::new)?;
    decode_reply::<U>(reply)
}

/// Suspends the current task on an arbitrary callback-style builder: `f` is
/// invoked with a continuation it must call exactly once, and may return a
/// [`BoxClosable`] the runtime records as the current-await so a later
/// `close()` can cancel it.
pub fn await_callback<R: Clone + 'static>(
    builder: impl FnOnce(Continuation<R>) -> Option<BoxClosable> + 'static,
) -> Result<R, Rc<TaskError>> {
    let request = AwaitRequest::Callback(Box::new(move |resume_cb| {
        let cont: Continuation<R> = Box::new(move |result: Result<R, Rc<TaskError>>| {
            resume_cb.fire(Reply::Value(Box::new(result)));
        });
        builder(cont)
    }));

    let reply = suspension::yield_suspend::<AwaitRequest, Reply>(request).map_err(Rc::new)?;
    decode_reply::<R>(reply)
}

/// Single-argument sibling of [`await_callback`] for the common case where
/// the external function never returns a closable handle.
pub fn await_fn<R: Clone + 'static>(f: impl FnOnce(Continuation<R>) + 'static) -> Result<R, Rc<TaskError>> {
    await_callback(move |cont| {
        f(cont);
        None
    })
}

/// Packages a callback-style builder as a reusable task body, so the same
/// external operation can be spawned standalone with [`run`] instead of
/// only awaited inline.
pub fn wrap<R: Clone + 'static>(
    builder: impl FnOnce(Continuation<R>) -> Option<BoxClosable> + 'static,
) -> impl FnOnce() -> Result<R, Rc<TaskError>> {
    move || await_callback(builder)
}

/// Reads the closing flag of whichever task is currently running. `false`
/// if called from outside any task.
pub fn is_closing() -> bool {
    crate::scheduler::current_task()
        .map(|t| t.is_closing())
        .unwrap_or(false)
}

/// Drives the current thread's host loop until `task` completes or
/// `timeout` elapses. Thin convenience over [`Task::wait`]; kept as a free
/// function for symmetry with `run`/`await_*` at call sites that don't
/// otherwise need the `Task` handle's other methods.
pub fn block_on<T: Clone + 'static>(
    task: &Task<T>,
    timeout: Option<Duration>,
) -> Result<T, crate::task::WaitError> {
    task.wait(timeout)
}

// Unused in the public surface today but kept importable for callers that
// need to downgrade a task handle for their own bookkeeping (e.g. a custom
// supervisor keeping a non-owning reference to a spawned task).
pub(crate) type AnyTaskWeak = Weak<dyn AnyTask>;

fn decode_reply<V: 'static>(reply: Reply) -> Result<V, Rc<TaskError>> {
    match reply {
        Reply::Value(boxed) => *boxed
            .downcast::<Result<V, Rc<TaskError>>>()
            .unwrap_or_else(|_| unreachable!("await reply has the wrong shape")),
        Reply::Error(e) => Err(e),
    }
}
