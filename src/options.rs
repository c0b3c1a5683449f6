//! Construction-time options for a [`Task`](crate::task::Task).

/// Default stack size for a task's underlying fiber (see `src/fiber.rs`).
///
/// Matches the common default stack size used by stackful-coroutine
/// libraries (4 MiB), large enough that ordinary recursive user code will
/// not overflow it.
pub const DEFAULT_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Builder for the handful of knobs a [`run`](crate::api::run) call may want
/// to override. Carried over from the teacher crate's `Options` type
/// (referenced, but not defined, in its `coroutine::clonable` module).
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) name: Option<String>,
    pub(crate) stack_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Options {
    /// Starts a builder with the runtime's defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the task a debug name, surfaced by `status()`'s sibling
    /// inspection helpers and in `traceback()` output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the fiber's stack size, in bytes.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }
}
