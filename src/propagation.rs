//! Component C5: error-up / cancel-down propagation across the task tree.
//!
//! Two flows meet here. Cancellation cascades *down*: closing a task closes
//! every child it has spawned so far, recursively, and closes whatever
//! external handle it is currently suspended on. Completion sweeps *up* one
//! level at a time: a task never publishes a result — success, failure, or
//! externally assigned via [`Task::complete`](crate::task::Task::complete) —
//! until every child it spawned has itself been force-closed and completed
//! (§8 scenarios 3 and 6: a parent cannot report success while a child it
//! spawned is still outstanding). A non-awaited child's error is buffered
//! into the parent's single pending-child-error slot instead of being
//! delivered immediately; [`crate::scheduler`]'s forced-reply check
//! surfaces it the next time the parent's own fiber is resumed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::trace;

use crate::error::TaskError;
use crate::task::{AnyTask, CurrentAwait, InternalState, TaskInner};

/// Requests cancellation of `task`. The first call cascades to already-
/// spawned children and to whatever handle `task` is currently suspended
/// on; later calls are no-ops except that they still register `on_closed`.
/// `on_closed` fires once `task` reaches `Completed`, immediately if it
/// already has.
pub(crate) fn close_task<T: Clone + 'static>(
    task: &Rc<TaskInner<T>>,
    on_closed: Option<Box<dyn FnOnce()>>,
) {
    let already_closing = task.closing.replace(true);

    if let Some(cb) = on_closed {
        task.add_notifier(cb);
    }

    if already_closing {
        trace!("Task {:?} close() is a no-op, already closing", task.id());
        return;
    }

    trace!("Closing task {:?}", task.id());
    for child in task.children_snapshot() {
        child.close_dyn(None);
    }

    let mut current = task.current_await.borrow_mut();
    if let CurrentAwait::Handle(handle) = &mut *current {
        // §4.4: "If the handle is already closing ... the runtime does not
        // re-close it; it simply waits for the originally-scheduled
        // callback." `handle` is always a `OnceGuardedClosable` by the time
        // it reaches here (see `scheduler::step`), so calling `close` again
        // on an already-closing handle is a no-op rather than a protocol
        // violation; the handle's own contract is to eventually resolve
        // whatever await produced it either way, at which point the
        // scheduler's forced-reply check overrides the outcome with
        // `Closed`.
        handle.close(Box::new(|| {}));
    }
}

/// Called once a task's body has produced a final result, however it got
/// there: a natural return, a caught panic, or an external
/// [`Task::complete`](crate::task::Task::complete) call. Forces every
/// remaining child closed, waits on all of them, and only then publishes
/// `body_result` — overridden with a framed child error if it was
/// otherwise `Ok` and some child surfaced a real (non-`closed`) error.
///
/// Guards the single-completion invariant itself rather than trusting
/// callers to pre-check: an external `complete()` and the task's own fiber
/// naturally finishing afterwards both funnel through here, and only the
/// first one may proceed. Returns `false` for whichever call loses that
/// race, discarding `body_result`; callers that need to report the loss
/// (`Task::complete`) use the return value to do so.
pub(crate) fn finish<T: Clone + 'static>(
    task: Rc<TaskInner<T>>,
    body_result: Result<T, Rc<TaskError>>,
) -> bool {
    if task.completing.replace(true) {
        // Lost the race: either a prior `finish` already published, or an
        // external `complete()` got here first and this is the task's own
        // fiber finishing afterwards. Either way there's nothing left to
        // resume.
        trace!("Task {:?} lost the completion race", task.id());
        task.fiber.borrow_mut().take();
        return false;
    }
    trace!("Draining children of task {:?} before publishing", task.id());

    // An external `Task::complete` can fire while this task's own fiber is
    // still parked on a handle (its body never gets to resume and release
    // it). Close that handle now so it isn't abandoned uninformed; the
    // fiber itself is dropped in `publish` regardless of whether the handle
    // ever calls back.
    if let CurrentAwait::Handle(mut handle) = task.take_current_await() {
        handle.close(Box::new(|| {}));
    }

    let children = task.children_snapshot();
    if children.is_empty() {
        publish(task, body_result);
        return true;
    }

    let remaining = Rc::new(Cell::new(children.len()));
    let child_error: Rc<RefCell<Option<Rc<TaskError>>>> = Rc::new(RefCell::new(None));
    let body_result = Rc::new(RefCell::new(Some(body_result)));

    for child in children {
        let remaining = remaining.clone();
        let child_error = child_error.clone();
        let task = task.clone();
        let body_result = body_result.clone();
        let child_for_error = child.clone();

        child.close_dyn(Some(Box::new(move || {
            if let Some(err) = child_for_error.error_payload() {
                if !err.is_closed() && child_error.borrow().is_none() {
                    *child_error.borrow_mut() = Some(err);
                }
            }

            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let mut result = body_result
                    .borrow_mut()
                    .take()
                    .expect("completion barrier should only fire once");
                if result.is_ok() {
                    if let Some(err) = child_error.borrow_mut().take() {
                        result = Err(err.framed_as_child_error());
                    }
                }
                publish(task.clone(), result);
            }
        })));
    }
}

fn publish<T: Clone + 'static>(task: Rc<TaskInner<T>>, result: Result<T, Rc<TaskError>>) {
    trace!("Marking task {:?} as completed", task.id());
    *task.result.borrow_mut() = Some(result);
    task.set_state(InternalState::Completed);
    task.set_current_await(CurrentAwait::None);
    task.fiber.borrow_mut().take();

    notify_parent_if_not_awaited(&task);

    for notifier in task.take_notifiers() {
        crate::scheduler::enqueue(notifier);
    }
}

fn notify_parent_if_not_awaited<T: Clone + 'static>(task: &Rc<TaskInner<T>>) {
    let Some(err) = task.error_payload() else {
        return;
    };
    if err.is_closed() {
        return;
    }
    let Some(parent) = task.parent_any() else {
        return;
    };
    let awaited_by_parent = parent
        .current_await_child()
        .map(|c| c.id() == task.id())
        .unwrap_or(false);
    if !awaited_by_parent {
        parent.set_pending_child_error(err.framed_as_child_error());
    }
}
