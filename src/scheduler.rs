//! Component C4: the scheduler / step loop.
//!
//! A *step* resumes a task's fiber and reacts to whatever it yields. The
//! trampoline requirement (§4.3: chains of synchronously-resolving awaits
//! must not grow the Rust call stack) is implemented by having
//! [`ResumeCb::fire`] write into a per-step "pending reply" slot instead of
//! recursing into [`step`] directly: the `loop` in [`step`] notices the slot
//! was filled before the builder call returned and simply `continue`s. Only
//! a *genuinely* asynchronous firing (one that happens after `step` has
//! already returned) re-enters `step` as a fresh call frame — and that kind
//! of reentry is bounded by real concurrency depth, not by how many
//! sequential completions happen to chain together.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, trace};

use crate::closable::BoxClosable;
use crate::error::TaskError;
use crate::fiber::FiberEvent;
use crate::suspension;
use crate::task::{AnyTask, CurrentAwait, InternalState, TaskId, TaskInner};

/// What a task yields through [`crate::suspension::yield_suspend`]. The
/// three `await_*` free functions in `crate::api` (§6, §9 "Dynamic dispatch
/// over polymorphic awaits") collapse to two request kinds here: awaiting a
/// specific child task needs `current-await` bookkeeping the scheduler must
/// see (so `close`/`traceback` can recognize "this task is awaiting that
/// one"), while `await_fn`/`await_callback`/`wrap` are all just builders
/// that hand the resume callback to arbitrary external code.
pub(crate) enum AwaitRequest {
    /// Await a specific child task by identity. `register` installs the
    /// (statically-typed, from the caller's perspective) notifier that
    /// delivers the child's result back through `resume_cb`.
    Task {
        child: Rc<dyn AnyTask>,
        register: Box<dyn FnOnce(ResumeCb)>,
    },
    /// Await an arbitrary callback-style function or external API.
    Callback(Box<dyn FnOnce(ResumeCb) -> Option<BoxClosable>>),
}

/// What `step` ultimately feeds back into a task's fiber at a suspension
/// point.
pub(crate) enum Reply {
    /// The naturally-typed payload for whichever await kind produced it —
    /// `Result<U, Rc<TaskError>>` boxed for `Task`, `Result<R, Rc<TaskError>>`
    /// boxed for `Callback`. The await wrapper that yielded the request is
    /// the only code that ever downcasts it, since it alone knows the
    /// concrete type.
    Value(Box<dyn Any>),
    /// A forced error overriding whatever the await's natural outcome would
    /// have been — used for the level-triggered `closed` signal and for
    /// delivering a buffered pending-child-error at a suspension point.
    Error(Rc<TaskError>),
}

struct ResumeSlot {
    in_progress: Cell<bool>,
    reply: RefCell<Option<Reply>>,
    fired: Cell<bool>,
}

impl ResumeSlot {
    fn new() -> Rc<ResumeSlot> {
        Rc::new(ResumeSlot {
            in_progress: Cell::new(true),
            reply: RefCell::new(None),
            fired: Cell::new(false),
        })
    }
}

/// Handed to a suspension request's builder. Calling it delivers `reply` to
/// the suspended task, either by trampolining (if the builder's own call is
/// still on the stack) or by re-entering [`step`] as a fresh call.
///
/// First invocation wins (§5: "A callback fired more than once by a
/// misbehaving external API must have only its first invocation honored").
pub(crate) struct ResumeCb {
    slot: Rc<ResumeSlot>,
    fire: Rc<dyn Fn(Reply)>,
}

impl Clone for ResumeCb {
    fn clone(&self) -> Self {
        ResumeCb {
            slot: self.slot.clone(),
            fire: self.fire.clone(),
        }
    }
}

impl ResumeCb {
    /// Delivers `reply`. No-op on every call after the first.
    pub(crate) fn fire(&self, reply: Reply) {
        if self.slot.fired.replace(true) {
            return;
        }
        if self.slot.in_progress.get() {
            *self.slot.reply.borrow_mut() = Some(reply);
        } else {
            let fire = self.fire.clone();
            enqueue(Box::new(move || (fire)(reply)));
        }
    }
}

thread_local! {
    /// The stack of tasks whose fiber is presently on the Rust call stack
    /// (outermost first), used to determine the current task for `run`'s
    /// parent-linking, `is_closing()`, and `status()`'s Running/Active
    /// distinction (§9: "the currently-running Task is a runtime-scoped
    /// accessor").
    static CURRENT_STACK: RefCell<Vec<Rc<dyn AnyTask>>> = RefCell::new(Vec::new());

    /// Deferred work: resumptions and notifier firings that would otherwise
    /// call back into `step`/each other directly. A chain of tasks each
    /// completing the next (§4.3, §8: ">10,000 chained synchronous
    /// await-completions") would otherwise recurse one Rust stack frame per
    /// link; routing every such call through this queue instead means each
    /// link's work runs and fully unwinds before the next link's work even
    /// starts, so the queue — not the call stack — is what grows.
    static WORK_QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Schedules `work` to run, draining the queue if nothing else is already
/// doing so. Safe to call reentrantly from within a queued thunk: a nested
/// call just appends and returns, relying on the outer drain loop to reach
/// it.
pub(crate) fn enqueue(work: Box<dyn FnOnce()>) {
    WORK_QUEUE.with(|q| q.borrow_mut().push_back(work));
    drain();
}

fn drain() {
    if DRAINING.with(|d| d.replace(true)) {
        return;
    }
    loop {
        let next = WORK_QUEUE.with(|q| q.borrow_mut().pop_front());
        match next {
            Some(work) => work(),
            None => break,
        }
    }
    DRAINING.with(|d| d.set(false));
}

pub(crate) fn current_task() -> Option<Rc<dyn AnyTask>> {
    CURRENT_STACK.with(|s| s.borrow().last().cloned())
}

pub(crate) fn is_topmost_current(id: TaskId) -> bool {
    CURRENT_STACK.with(|s| s.borrow().last().map(|t| t.id()) == Some(id))
}

pub(crate) fn is_on_current_stack(id: TaskId) -> bool {
    CURRENT_STACK.with(|s| s.borrow().iter().any(|t| t.id() == id))
}

/// Plain passthrough to the task body. The panic→[`TaskError::User`]
/// conversion that keeps careless user code (e.g. an `unwrap()` on a `None`)
/// from taking down the whole host process does not live here: it happens
/// two layers out, in [`crate::fiber`]'s trampoline (`catch_unwind` around
/// the whole fiber body) and this module's own [`panic_to_error`], which
/// `step` consumes from `FiberEvent::Finished(Err(panic))`. This wrapper
/// exists only as the named seam `Task::new` calls into.
pub(crate) fn run_task_body<T: Clone + 'static>(
    body: impl FnOnce() -> Result<T, Rc<TaskError>>,
) -> Result<T, Rc<TaskError>> {
    body()
}

fn panic_to_error(panic: Box<dyn Any + Send>) -> Rc<TaskError> {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    };
    Rc::new(TaskError::msg(msg))
}

fn encode_value<V: 'static>(v: V) -> Box<dyn Any> {
    Box::new(v)
}

/// Starts a task: the first resume, carrying no reply. Routed through the
/// same work queue as every other resumption, so a `run` call made from
/// inside an already-executing task's body composes with the trampoline
/// rather than adding a fresh Rust call frame of its own.
pub(crate) fn start<T: Clone + 'static>(task: Rc<TaskInner<T>>) {
    trace!("Scheduling task {:?} for its first resume", task.id());
    enqueue(Box::new(move || step(task, encode_value(()))));
}

/// Feeds `reply` into a task's fiber and drives it forward, trampolining
/// through any chain of synchronously-resolving awaits.
fn step<T: Clone + 'static>(task: Rc<TaskInner<T>>, initial_reply: Box<dyn Any>) {
    let mut reply_payload = Some(initial_reply);

    loop {
        let event = {
            let fiber_ref = task.fiber.borrow();
            match fiber_ref.as_ref() {
                Some(fiber) => {
                    CURRENT_STACK.with(|s| s.borrow_mut().push(task.clone() as Rc<dyn AnyTask>));
                    let payload = reply_payload.take().unwrap_or_else(|| encode_value(()));
                    let event = fiber.resume(payload);
                    CURRENT_STACK.with(|s| {
                        s.borrow_mut().pop();
                    });
                    event
                }
                None => return, // already completed/finalized; nothing to resume.
            }
        };

        match event {
            FiberEvent::Finished(Ok(boxed)) => {
                let result = *boxed
                    .downcast::<Result<T, Rc<TaskError>>>()
                    .unwrap_or_else(|_| unreachable!("task body result has the wrong shape"));
                debug!("Task {:?} body finished, ok = {}", task.id(), result.is_ok());
                crate::propagation::finish(task, result);
                return;
            }
            FiberEvent::Finished(Err(panic)) => {
                trace!("Task {:?} body panicked", task.id());
                crate::propagation::finish(task, Err(panic_to_error(panic)));
                return;
            }
            FiberEvent::Yielded(payload) => {
                let (marker, req) = match suspension::unwrap_request::<AwaitRequest>(payload) {
                    Ok(x) => x,
                    Err(misuse) => {
                        debug!("Task {:?} misused its coroutine: {}", task.id(), misuse);
                        crate::propagation::finish(task, Err(Rc::new(misuse)));
                        return;
                    }
                };

                if let Some(forced) = forced_reply(&task) {
                    reply_payload = Some(encode_reply(marker, forced));
                    continue;
                }

                let slot = ResumeSlot::new();
                let resume_cb = make_resume_cb(task.clone(), marker, slot.clone());

                match req {
                    AwaitRequest::Callback(builder) => {
                        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            builder(resume_cb.clone())
                        })) {
                            Ok(Some(handle)) => {
                                // Guard against a double-close regardless of
                                // which of the (possibly more than one) code
                                // path ends up closing this handle — see
                                // `closable::OnceGuardedClosable` (§5:
                                // "Reentrancy hazards").
                                let guarded: BoxClosable =
                                    Box::new(crate::closable::OnceGuardedClosable::new(handle));
                                task.set_current_await(CurrentAwait::Handle(guarded));
                            }
                            Ok(None) => {}
                            Err(panic) => {
                                slot.in_progress.set(false);
                                crate::propagation::finish(task, Err(panic_to_error(panic)));
                                return;
                            }
                        }
                    }
                    AwaitRequest::Task { child, register } => {
                        task.set_current_await(CurrentAwait::Child(child));
                        register(resume_cb.clone());
                    }
                }

                slot.in_progress.set(false);
                if let Some(r) = slot.reply.borrow_mut().take() {
                    task.set_current_await(CurrentAwait::None);
                    reply_payload = Some(encode_reply(marker, r));
                    continue;
                } else {
                    trace!("Task {:?} is now awaiting", task.id());
                    task.set_state(InternalState::Awaiting);
                    return;
                }
            }
        }
    }
}

fn forced_reply<T: Clone + 'static>(task: &Rc<TaskInner<T>>) -> Option<Reply> {
    if task.closing.get() {
        Some(Reply::Error(Rc::new(TaskError::Closed)))
    } else {
        task.take_pending_child_error().map(Reply::Error)
    }
}

fn encode_reply(marker: suspension::Marker, reply: Reply) -> Box<dyn Any> {
    suspension::wrap_reply(marker, reply)
}

fn make_resume_cb<T: Clone + 'static>(
    task: Rc<TaskInner<T>>,
    marker: suspension::Marker,
    slot: Rc<ResumeSlot>,
) -> ResumeCb {
    let fire: Rc<dyn Fn(Reply)> = Rc::new(move |reply: Reply| {
        task.set_current_await(CurrentAwait::None);
        let reply = forced_reply(&task).unwrap_or(reply);
        step(task.clone(), encode_reply(marker, reply));
    });
    ResumeCb { slot, fire }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// §5 "Reentrancy hazards": "A callback fired more than once by a
    /// misbehaving external API must have only its first invocation
    /// honored." `ResumeCb` is the one place in the runtime that can
    /// actually be cloned and invoked from more than one call site (the
    /// scheduler's own `register(resume_cb.clone())` paths), so this tests
    /// the guard directly rather than through the public API — a
    /// `Continuation<R>` handed to user code is a `Box<dyn FnOnce>`, which
    /// the type system already prevents from being called twice.
    #[test]
    fn resume_cb_only_honors_its_first_fire() {
        let slot = ResumeSlot::new();
        slot.in_progress.set(false);

        let calls = Rc::new(Cell::new(0u32));
        let calls_for_fire = calls.clone();
        let fire: Rc<dyn Fn(Reply)> = Rc::new(move |_reply: Reply| {
            calls_for_fire.set(calls_for_fire.get() + 1);
        });
        let resume_cb = ResumeCb {
            slot: slot.clone(),
            fire,
        };

        resume_cb.fire(Reply::Error(Rc::new(TaskError::Closed)));
        resume_cb.clone().fire(Reply::Error(Rc::new(TaskError::Closed)));
        resume_cb.fire(Reply::Error(Rc::new(TaskError::Closed)));

        assert_eq!(calls.get(), 1, "only the first of three fires may be honored");
    }
}
