//! Shared helpers for the integration suite: a tick-based stand-in for
//! `sleep`, since the core has no timer of its own (§4.5: timers are a
//! user-level callback-style API, not part of the core), plus a one-time
//! logger init mirroring the teacher's `static INIT: Once` test pattern.

use std::rc::Rc;
use std::sync::Once;

use cortask::{await_fn, schedule_on_next_tick, TaskError};

static INIT: Once = Once::new();

/// Initializes `env_logger` exactly once per process, so every test can call
/// it unconditionally without double-installing a logger.
pub fn init_log() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Suspends the current task for `ticks` host-loop iterations. Stands in for
/// the scenarios' `sleep(n)` calls: the core itself has no notion of time,
/// only "the next tick", so a multi-tick sleep is just that many chained
/// single-tick awaits.
pub fn delay(ticks: u32) -> Result<(), Rc<TaskError>> {
    for _ in 0..ticks {
        await_fn::<()>(|cont| {
            schedule_on_next_tick(Box::new(move || cont(Ok(()))));
        })?;
    }
    Ok(())
}

/// A task body that never returns on its own — the `eternity` task used
/// throughout the scenarios to model "a child that only ends because it was
/// closed".
pub fn eternity() -> Result<(), Rc<TaskError>> {
    loop {
        delay(1)?;
    }
}

/// As [`eternity`], but typed for a `Task<u32>` — used by tests that need an
/// externally-`complete()`-able task of a non-`()` success type.
pub fn eternity_u32() -> Result<u32, Rc<TaskError>> {
    loop {
        delay(1)?;
    }
}
