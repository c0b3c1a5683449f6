//! Component C3: the Task object — identity, state, result slot, children,
//! current-await, notifier list, pending-child-error slot, and lifecycle.
//!
//! A [`Task<T>`] is a thin, `Clone`-able handle around a reference-counted
//! [`TaskInner<T>`]. The runtime keeps exactly one [`TaskInner`] allocation
//! per task; parents own their children strongly (`Rc`), children hold their
//! parent only weakly (`Weak`), matching the data model's "owning
//! parent→child, weak child→parent" shape.
//!
//! Cross-task bookkeeping (the children list, the notifier list, closing
//! cascades, tracebacks) needs to operate without knowing a task's own
//! success-value type `T`, so all of that is exposed through the
//! object-safe [`AnyTask`] trait and stored as `Rc<dyn AnyTask>`. The only
//! code that ever needs `T` concretely is the call site that created the
//! `Task<T>` handle and the await functions in [`crate::api`] — propagation
//! and the scheduler never downcast a task's own result type.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use log::trace;

use crate::closable::BoxClosable;
use crate::error::TaskError;
use crate::fiber::Fiber;
use crate::options::Options;

/// Opaque task identity, stable for the task's lifetime. Used for debug
/// output and for locating a task within its parent's children list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

fn next_task_id() -> TaskId {
    thread_local! {
        static NEXT: Cell<u64> = const { Cell::new(1) };
    }
    NEXT.with(|n| {
        let id = n.get();
        n.set(id + 1);
        TaskId(id)
    })
}

/// The observable lifecycle stage of a task (§4.2 `status()`, with "Awaiting"
/// adopted over "Suspended" per the Open Questions resolution in `SPEC_FULL.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// This task's own fiber is the one currently executing on the call stack.
    Running,
    /// Suspended on a current-await (a child task or a closable handle).
    Awaiting,
    /// Constructed and not completed, but neither `Running` nor `Awaiting`
    /// right now — e.g. nested below another task's resume on the call
    /// stack, or momentarily between a notifier firing and its own next step.
    Active,
    /// Terminal. Exactly one of the result slot's two cases is set.
    Completed,
}

/// The slot a task is blocked on: nothing, an external closable handle, or a
/// child task being awaited by identity. At most one of these per task.
pub(crate) enum CurrentAwait {
    None,
    Handle(BoxClosable),
    Child(Rc<dyn AnyTask>),
}

impl CurrentAwait {
    fn is_some(&self) -> bool {
        !matches!(self, CurrentAwait::None)
    }
}

/// Type-erased operations needed by the scheduler and propagation engine,
/// which must walk a task tree of mixed `Task<T>` instantiations without
/// knowing any one task's success-value type.
pub(crate) trait AnyTask {
    fn id(&self) -> TaskId;
    fn name(&self) -> Option<&str>;
    fn creation_site(&self) -> &str;
    fn status(&self) -> TaskStatus;
    fn completed(&self) -> bool;
    fn is_closing(&self) -> bool;

    /// Requests cancellation of this task (and transitively, its
    /// descendants). `on_closed`, if given, is registered as a notifier and
    /// fires once this task reaches `Completed`.
    fn close_dyn(&self, on_closed: Option<Box<dyn FnOnce()>>);

    /// Registers a callback to run once this task reaches `Completed`. Fires
    /// synchronously if the task is already completed.
    fn add_notifier(&self, cb: Box<dyn FnOnce()>);

    /// `Some(err)` if this task completed with an error; `None` if it
    /// completed `Ok` or hasn't completed yet.
    fn error_payload(&self) -> Option<Rc<TaskError>>;

    /// A snapshot of the direct children list, for propagation sweeps.
    fn children_snapshot(&self) -> Vec<Rc<dyn AnyTask>>;

    /// If this task's current-await is a child task, that child — used by
    /// `traceback()` to walk the nested-await chain.
    fn current_await_child(&self) -> Option<Rc<dyn AnyTask>>;

    /// Detaches this task from its parent's children list (severs the
    /// propagation link without destroying the task).
    fn detach_dyn(&self);

    fn self_rc(&self) -> Rc<dyn AnyTask>;

    /// Removes the child with the given id from this task's children list.
    /// Used by `detach_dyn` on the child's side to sever the link.
    fn remove_child(&self, id: TaskId);

    /// Appends `child` to this task's children list. Used when linking a
    /// freshly-created task to whichever task is currently running.
    fn add_child(&self, child: Rc<dyn AnyTask>);

    /// Buffers a non-awaited child's error for delivery at this task's next
    /// suspension point. Overwrites only if the slot is empty — see
    /// [`TaskInner::set_pending_child_error_if_absent`].
    fn set_pending_child_error(&self, err: Rc<TaskError>);
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalState {
    Created,
    Awaiting,
    Completed,
}

pub(crate) struct TaskInner<T: Clone + 'static> {
    id: TaskId,
    name: Option<String>,
    creation_site: String,
    pub(crate) fiber: RefCell<Option<Fiber>>,
    state: Cell<InternalState>,
    pub(crate) result: RefCell<Option<Result<T, Rc<TaskError>>>>,
    pub(crate) completing: Cell<bool>,
    pub(crate) closing: Cell<bool>,
    parent: RefCell<Option<Weak<dyn AnyTask>>>,
    children: RefCell<Vec<Rc<dyn AnyTask>>>,
    pub(crate) current_await: RefCell<CurrentAwait>,
    notifiers: RefCell<Vec<Box<dyn FnOnce()>>>,
    pub(crate) pending_child_error: RefCell<Option<Rc<TaskError>>>,
    self_weak: RefCell<Weak<TaskInner<T>>>,
}

impl<T: Clone + 'static> TaskInner<T> {
    pub(crate) fn self_rc_typed(&self) -> Rc<TaskInner<T>> {
        self.self_weak
            .borrow()
            .upgrade()
            .expect("task dropped its own self-reference")
    }

    pub(crate) fn take_pending_child_error(&self) -> Option<Rc<TaskError>> {
        self.pending_child_error.borrow_mut().take()
    }

    pub(crate) fn set_pending_child_error_if_absent(&self, err: Rc<TaskError>) {
        let mut slot = self.pending_child_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn creation_site(&self) -> &str {
        &self.creation_site
    }

    pub(crate) fn set_state(&self, state: InternalState) {
        self.state.set(state);
    }

    pub(crate) fn set_current_await(&self, await_: CurrentAwait) {
        *self.current_await.borrow_mut() = await_;
    }

    pub(crate) fn take_current_await(&self) -> CurrentAwait {
        std::mem::replace(&mut *self.current_await.borrow_mut(), CurrentAwait::None)
    }

    pub(crate) fn add_child_typed(&self, child: Rc<dyn AnyTask>) {
        self.children.borrow_mut().push(child);
    }

    /// Links this task as a child of `parent`, mirroring the strong
    /// parent→child / weak child→parent shape (the parent side is linked
    /// separately by the caller via `add_child_typed`).
    pub(crate) fn set_parent(&self, parent: Weak<dyn AnyTask>) {
        *self.parent.borrow_mut() = Some(parent);
    }

    pub(crate) fn parent_any(&self) -> Option<Rc<dyn AnyTask>> {
        self.parent.borrow().as_ref().and_then(|w| w.upgrade())
    }

    /// Drains the notifier list, for firing once at completion. Later
    /// registrations (after completion) are fired synchronously by
    /// `add_notifier` instead of going through this list at all.
    pub(crate) fn take_notifiers(&self) -> Vec<Box<dyn FnOnce()>> {
        std::mem::take(&mut *self.notifiers.borrow_mut())
    }
}

impl<T: Clone + 'static> AnyTask for TaskInner<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn creation_site(&self) -> &str {
        &self.creation_site
    }

    fn status(&self) -> TaskStatus {
        if self.result.borrow().is_some() {
            return TaskStatus::Completed;
        }
        if crate::scheduler::is_topmost_current(self.id) {
            return TaskStatus::Running;
        }
        if crate::scheduler::is_on_current_stack(self.id) {
            return TaskStatus::Active;
        }
        match self.state.get() {
            InternalState::Awaiting if self.current_await.borrow().is_some() => {
                TaskStatus::Awaiting
            }
            _ => TaskStatus::Active,
        }
    }

    fn completed(&self) -> bool {
        self.result.borrow().is_some()
    }

    fn is_closing(&self) -> bool {
        self.closing.get()
    }

    fn close_dyn(&self, on_closed: Option<Box<dyn FnOnce()>>) {
        crate::propagation::close_task(&self.self_rc_typed(), on_closed);
    }

    fn add_notifier(&self, cb: Box<dyn FnOnce()>) {
        if self.completed() {
            crate::scheduler::enqueue(cb);
            return;
        }
        self.notifiers.borrow_mut().push(cb);
    }

    fn error_payload(&self) -> Option<Rc<TaskError>> {
        match &*self.result.borrow() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    fn children_snapshot(&self) -> Vec<Rc<dyn AnyTask>> {
        self.children.borrow().clone()
    }

    fn current_await_child(&self) -> Option<Rc<dyn AnyTask>> {
        match &*self.current_await.borrow() {
            CurrentAwait::Child(c) => Some(c.clone()),
            _ => None,
        }
    }

    fn detach_dyn(&self) {
        if let Some(parent) = self.parent.borrow_mut().take().and_then(|w| w.upgrade()) {
            parent.remove_child(self.id);
        }
    }

    fn self_rc(&self) -> Rc<dyn AnyTask> {
        self.self_rc_typed() as Rc<dyn AnyTask>
    }

    fn remove_child(&self, id: TaskId) {
        self.children.borrow_mut().retain(|c| c.id() != id);
    }

    fn add_child(&self, child: Rc<dyn AnyTask>) {
        self.add_child_typed(child);
    }

    fn set_pending_child_error(&self, err: Rc<TaskError>) {
        self.set_pending_child_error_if_absent(err);
    }
}

/// A handle to a running or completed task. Cloning a `Task<T>` clones the
/// handle, not the underlying task — all clones refer to the same
/// [`TaskInner`].
pub struct Task<T: Clone + 'static> {
    pub(crate) inner: Rc<TaskInner<T>>,
}

impl<T: Clone + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.inner.status())
            .finish()
    }
}

/// Outcome of [`Task::wait`].
#[derive(Debug)]
pub enum WaitError {
    /// The deadline elapsed before the task completed. The task itself is
    /// untouched — it keeps running.
    Timeout,
    /// The task completed with an error.
    Task(Rc<TaskError>),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timeout"),
            WaitError::Task(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Outcome of [`Task::pwait`], the non-throwing sibling of [`Task::wait`].
#[derive(Debug)]
pub enum PWait<T> {
    Ok(T),
    Err(Rc<TaskError>),
    Timeout,
}

impl<T: Clone + 'static> Task<T> {
    #[track_caller]
    pub(crate) fn new(opts: Options, body: impl FnOnce() -> Result<T, Rc<TaskError>> + 'static) -> Task<T> {
        let location = std::panic::Location::caller();
        let creation_site = format!("{}:{}", location.file(), location.line());
        let inner = Rc::new_cyclic(|weak_self: &Weak<TaskInner<T>>| TaskInner {
            id: next_task_id(),
            name: opts.name().map(|s| s.to_string()),
            creation_site,
            fiber: RefCell::new(None),
            state: Cell::new(InternalState::Created),
            result: RefCell::new(None),
            completing: Cell::new(false),
            closing: Cell::new(false),
            parent: RefCell::new(None),
            children: RefCell::new(Vec::new()),
            current_await: RefCell::new(CurrentAwait::None),
            notifiers: RefCell::new(Vec::new()),
            pending_child_error: RefCell::new(None),
            self_weak: RefCell::new(weak_self.clone()),
        });

        let fiber = Fiber::spawn(
            move || -> Box<dyn std::any::Any> {
                let result = crate::scheduler::run_task_body(body);
                Box::new(result)
            },
            opts.stack_size(),
        );
        *inner.fiber.borrow_mut() = Some(fiber);

        trace!(
            "Registered task {:?} ({:?}) at {}",
            inner.id,
            inner.name,
            inner.creation_site
        );
        Task { inner }
    }

    /// This task's opaque identity.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The debug name supplied at creation, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    /// `file:line` of the `run`/`run_opts` call site that created this task.
    pub fn creation_site(&self) -> &str {
        self.inner.creation_site()
    }

    /// Current lifecycle stage (§4.2).
    pub fn status(&self) -> TaskStatus {
        self.inner.status()
    }

    /// True once this task has published a terminal result.
    pub fn completed(&self) -> bool {
        self.inner.completed()
    }

    /// True once cancellation has been requested (level-triggered; never
    /// clears).
    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    /// Drives the host loop until this task completes or `timeout` elapses,
    /// raising the task's own error if it completed with one.
    pub fn wait(&self, timeout: Option<std::time::Duration>) -> Result<T, WaitError> {
        let completed = crate::host::block_until(|| self.completed(), timeout);
        if !completed {
            return Err(WaitError::Timeout);
        }
        match self.inner.result.borrow().clone().expect("completed implies a result") {
            Ok(v) => Ok(v),
            Err(e) => Err(WaitError::Task(e)),
        }
    }

    /// Non-throwing sibling of [`Task::wait`].
    pub fn pwait(&self, timeout: Option<std::time::Duration>) -> PWait<T> {
        let completed = crate::host::block_until(|| self.completed(), timeout);
        if !completed {
            return PWait::Timeout;
        }
        match self.inner.result.borrow().clone().expect("completed implies a result") {
            Ok(v) => PWait::Ok(v),
            Err(e) => PWait::Err(e),
        }
    }

    /// Requests cancellation. Idempotent: only the first call's cascade has
    /// effect, but every supplied `on_closed` is registered and fires once
    /// this task (and its transitively-closed descendants) reach `Completed`.
    /// Fires `on_closed` synchronously if already completed.
    pub fn close(&self, on_closed: Option<Box<dyn FnOnce()>>) {
        crate::propagation::close_task(&self.inner, on_closed);
    }

    /// Externally assigns this task a successful terminal result. Fails if
    /// the task is already completing or completed. Remaining children are
    /// closed (not completed) as part of the same sweep used for natural
    /// completion.
    pub fn complete(&self, value: T) -> Result<(), TaskError> {
        // `finish` itself owns the completing test-and-set (it has to: the
        // task's own fiber can race this call through the same guard), so
        // this just forwards the value and reports whichever side the race
        // landed on rather than pre-flighting the flag here too.
        if crate::propagation::finish(self.inner.clone(), Ok(value)) {
            trace!("Task {:?} completed externally via complete()", self.inner.id);
            Ok(())
        } else {
            log::debug!("complete() on task {:?} lost the race", self.inner.id);
            Err(TaskError::AlreadyCompleting)
        }
    }

    /// Severs the parent→child propagation link. The task becomes a root
    /// from the propagation engine's perspective. Returns `self` for
    /// chaining, mirroring the scripting original's fluent style.
    pub fn detach(self) -> Self {
        self.inner.detach_dyn();
        self
    }

    /// Produces a multi-frame trace by walking the current-await chain of
    /// nested tasks, so an error surfaced at the top of a chain still shows
    /// the frame where it actually originated.
    pub fn traceback(&self, msg: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(m) = msg {
            out.push_str(m);
            out.push('\n');
        }
        let mut cur: Rc<dyn AnyTask> = self.inner.clone() as Rc<dyn AnyTask>;
        loop {
            out.push_str("  at ");
            out.push_str(cur.name().unwrap_or("<anonymous>"));
            out.push_str(" (");
            out.push_str(cur.creation_site());
            out.push_str(")\n");
            match cur.current_await_child() {
                Some(child) => cur = child,
                None => break,
            }
        }
        out
    }
}
