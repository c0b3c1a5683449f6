//! Integration tests for the "Universal invariants" list (as opposed to the
//! numbered "Concrete scenarios", covered in `tests/scenarios.rs`): single-
//! completion, no-orphan, handle-closure, marker hygiene, level-triggered
//! cancellation, edge-triggered errors, deep synchronous continuations, and
//! idempotent close.

mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cortask::{await_callback, await_fn, await_task, run, Closable, PWait, Task, TaskError};

#[test]
fn single_completion_second_complete_fails() {
    support::init_log();

    let task: Task<u32> = run(support::eternity_u32);
    task.complete(1).expect("first complete wins");
    match task.complete(2) {
        Err(TaskError::AlreadyCompleting) => {}
        other => panic!("expected AlreadyCompleting, got {other:?}"),
    }

    match task.pwait(None) {
        PWait::Ok(v) => assert_eq!(v, 1),
        other => panic!("expected the first complete()'s value to publish, got {other:?}"),
    }
}

#[test]
fn no_orphan_children_are_completed_when_parent_completes() {
    support::init_log();

    let children: Rc<RefCell<Vec<Task<()>>>> = Rc::new(RefCell::new(Vec::new()));
    let children_body = children.clone();

    let parent = run(move || {
        for _ in 0..3 {
            children_body.borrow_mut().push(run(support::eternity));
        }
        Ok::<_, Rc<TaskError>>(())
    });

    parent.wait(None).expect("parent completes once its swept children are done");

    for child in children.borrow().iter() {
        assert!(child.completed(), "every child must be Completed once the parent is");
    }
}

struct TrackedHandle {
    closed: Rc<Cell<bool>>,
}

impl Closable for TrackedHandle {
    fn close(&mut self, on_closed: Box<dyn FnOnce()>) {
        self.closed.set(true);
        on_closed();
    }
}

#[test]
fn handle_closure_outstanding_handle_is_closed_on_cancellation() {
    support::init_log();

    let closed = Rc::new(Cell::new(false));
    let closed_for_handle = closed.clone();

    let task: Task<()> = run(move || {
        await_callback::<()>(move |_cont| {
            Some(Box::new(TrackedHandle {
                closed: closed_for_handle.clone(),
            }))
        })
    });

    // `run` steps the fiber synchronously up to its first suspension before
    // returning, so the handle is already installed as current-await here.
    task.close(None);

    match task.pwait(None) {
        PWait::Err(e) => assert!(e.is_closed()),
        other => panic!("expected the task to end closed, got {other:?}"),
    }
    assert!(closed.get(), "the outstanding closable must be closed, not leaked");
}

#[test]
fn marker_hygiene_direct_fiber_resume_is_rejected() {
    // The mismatched-marker case itself is exercised at the unit level in
    // `src/suspension.rs`, since reaching into a live task's fiber from
    // outside the crate isn't possible through the public API — by design,
    // per invariant 7 ("No coroutine other than the Task's own scheduler
    // path ever calls resume on the Task's coroutine"). A `Continuation<R>`
    // is a `Box<dyn FnOnce>`, so the type system itself already rules out a
    // builder invoking it twice (the first call moves it out) — there is no
    // safe-Rust way to construct the "misbehaving callback fires twice"
    // scenario at this layer. What *is* observable from here is §4.3's
    // "recursively-nested synchronous completions" requirement: a chain of
    // tasks that each complete without ever suspending must still resolve
    // through `await_task` without deferring to the host loop at all.
    support::init_log();

    let task = run(|| {
        let a = run(|| Ok::<_, Rc<TaskError>>(1u32));
        let b = run(move || {
            let v = await_task(&a)?;
            Ok::<_, Rc<TaskError>>(v + 1)
        });
        let v = await_task(&b)?;
        Ok::<_, Rc<TaskError>>(v + 1)
    });

    assert_eq!(task.wait(None).unwrap(), 3);
}

#[test]
fn level_triggered_cancellation_survives_five_consecutive_pcall_catches() {
    support::init_log();

    let catches: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));
    let catches_body = catches.clone();

    let task = run(move || {
        for _ in 0..5 {
            match support::delay(1) {
                Ok(()) => catches_body.borrow_mut().push(false),
                Err(e) => catches_body.borrow_mut().push(e.is_closed()),
            }
        }
        Ok::<_, Rc<TaskError>>(())
    });

    task.close(None);

    let _ = task.wait(None); // the task's own terminal result is Err("closed"); not the point of this test.
    let catches = catches.borrow();
    assert_eq!(catches.len(), 5, "every suspension after close() must observe it: {catches:?}");
    assert!(catches.iter().all(|&c| c), "all five catches must see closed=true: {catches:?}");
}

#[test]
fn edge_triggered_error_does_not_resurface_after_being_caught() {
    support::init_log();

    let task = run(|| {
        let child = run(|| Err::<(), _>(Rc::new(TaskError::msg("boom"))));
        let first = await_task(&child);
        assert!(first.is_err());
        // The error was consumed by the explicit await above; a further
        // suspension must not see it again.
        support::delay(1)?;
        Ok::<_, Rc<TaskError>>(())
    });

    task.wait(None).expect("the caught child error must not re-surface");
}

#[test]
fn deep_synchronous_continuations_do_not_overflow_the_stack() {
    support::init_log();

    const DEPTH: u32 = 10_000;

    let task: Task<u32> = run(|| {
        let mut n = 0u32;
        for _ in 0..DEPTH {
            n = await_fn::<u32>(move |cont| {
                // Synchronously invoke the resume callback from inside the
                // builder: this is exactly the shape the trampoline in
                // `scheduler::step` must absorb without recursing.
                cont(Ok(n + 1));
            })?;
        }
        Ok::<_, Rc<TaskError>>(n)
    });

    assert_eq!(task.wait(None).unwrap(), DEPTH);
}

#[test]
fn idempotent_close_only_first_call_cascades_every_callback_fires() {
    support::init_log();

    let task: Task<()> = run(support::eternity);

    let fired = Rc::new(Cell::new(0u32));
    for _ in 0..4 {
        let fired = fired.clone();
        task.close(Some(Box::new(move || {
            fired.set(fired.get() + 1);
        })));
    }

    match task.pwait(None) {
        PWait::Err(e) => assert!(e.is_closed()),
        other => panic!("expected the task to end closed, got {other:?}"),
    }
    assert_eq!(fired.get(), 4, "every close() caller's callback must still fire");
}
