//! `cortask`: a single-threaded structured-concurrency task runtime built on
//! stackful coroutines.
//!
//! A [`Task`](task::Task) is a cooperatively-scheduled coroutine plus the
//! bookkeeping needed to compose many of them into a supervision tree:
//! parents own the children they spawn, a child's error surfaces on its
//! parent, and closing a task cascades down to everything it (transitively)
//! spawned. The runtime drives itself off a host-supplied event loop (see
//! [`host`]) rather than owning one — embedding it in a GUI's frame loop, an
//! `io_uring` reactor, or a test harness are all just different
//! [`host::HostLoop`] implementations.
//!
//! ```no_run
//! use cortask::prelude::*;
//!
//! let task = run(|| {
//!     let child = run(|| Ok::<_, std::rc::Rc<TaskError>>(41));
//!     let n = await_task(&child)?;
//!     Ok::<_, std::rc::Rc<TaskError>>(n + 1)
//! });
//!
//! assert_eq!(task.wait(None).unwrap(), 42);
//! ```
//!
//! See the module docs on [`task`], [`scheduler`], and [`propagation`] for
//! the core state machine; [`closable`] and [`host`] for the two seams a
//! host and external callback-style APIs plug into.

pub mod api;
pub mod closable;
pub mod error;
pub mod fiber;
pub mod host;
pub mod options;
pub mod propagation;
pub mod scheduler;
pub mod suspension;
pub mod task;

pub use api::{await_callback, await_fn, await_task, block_on, is_closing, run, run_opts, wrap, Continuation};
pub use closable::{BoxClosable, Closable};
pub use error::{TaskError, TaskResult};
pub use host::{schedule_on_next_tick, set_host_loop, HostLoop, SimpleHostLoop};
pub use options::Options;
pub use task::{PWait, Task, TaskId, TaskStatus, WaitError};

/// Re-exports of the external API surface (§6/C7), for `use cortask::prelude::*;`
/// call sites that want `run`/`await_*`/`wrap` without naming each module.
///
/// Mirrors the pattern the retrieval pack's own scope-construction macro
/// (`concurrency/scope/mod.rs`'s `run!`) uses to hide its construction
/// boilerplate behind a short, memorable entry point.
pub mod prelude {
    pub use crate::api::{
        await_callback, await_fn, await_task, block_on, is_closing, run, run_opts, wrap, Continuation,
    };
    pub use crate::closable::{BoxClosable, Closable};
    pub use crate::error::{TaskError, TaskResult};
    pub use crate::host::{schedule_on_next_tick, set_host_loop, HostLoop, SimpleHostLoop};
    pub use crate::options::Options;
    pub use crate::task::{PWait, Task, TaskId, TaskStatus, WaitError};
}

/// Spawns a task from a block, forwarding to [`run`](api::run). Saves
/// writing out the `Result<_, std::rc::Rc<cortask::TaskError>>` annotation
/// `?` needs to infer at a task body's tail position.
///
/// ```no_run
/// use cortask::prelude::*;
///
/// let t = cortask::spawn!({
///     let n = await_fn::<i32>(|cont| cont(Ok(1)))?;
///     Ok(n + 1)
/// });
/// assert_eq!(t.wait(None).unwrap(), 2);
/// ```
#[macro_export]
macro_rules! spawn {
    ($body:block) => {
        $crate::run(move || -> Result<_, std::rc::Rc<$crate::TaskError>> { $body })
    };
}
