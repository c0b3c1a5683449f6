//! Component C2 (the marker-gated half): the single yield/resume bridge
//! between user code running inside a task and the scheduler.
//!
//! `fiber::suspend`/`Fiber::resume` are an untyped, unguarded ping-pong. This
//! module adds the discipline the data model requires: every suspension is
//! tagged with a fresh [`Marker`], and a reply is only accepted if its
//! marker matches. A mismatch — which can only happen if something resumed
//! the fiber outside of the scheduler's own step loop, or yielded through
//! [`crate::fiber::suspend`] directly instead of through
//! [`yield_suspend`] — is surfaced as [`TaskError::CoroutineMisuse`] rather
//! than corrupting the runtime.

use crate::error::TaskError;
use crate::fiber;
use std::any::Any;
use std::cell::Cell;

/// Tags one suspend/resume round trip. Monotonically increasing per OS
/// thread; never reused while a runtime is alive, which is what makes a
/// mismatch a reliable signal of misuse rather than a false positive from
/// marker reuse.
pub type Marker = u64;

thread_local! {
    static NEXT_MARKER: Cell<Marker> = const { Cell::new(1) };
}

fn next_marker() -> Marker {
    NEXT_MARKER.with(|c| {
        let m = c.get();
        c.set(m + 1);
        m
    })
}

struct Envelope<T> {
    marker: Marker,
    value: T,
}

/// Task-side: yields `request` to the scheduler and blocks until a reply
/// tagged with the same marker arrives.
///
/// `Req`/`Rep` are concrete types private to this crate (see
/// [`crate::scheduler::AwaitRequest`] and the scheduler's reply type); the
/// marker check is what stands in for a true type-safe channel given that
/// the underlying fiber primitive only moves `Box<dyn Any>`.
pub(crate) fn yield_suspend<Req, Rep>(request: Req) -> Result<Rep, TaskError>
where
    Req: 'static,
    Rep: 'static,
{
    let marker = next_marker();
    let reply = fiber::suspend(Box::new(Envelope {
        marker,
        value: request,
    }));

    match reply.downcast::<Envelope<Rep>>() {
        Ok(envelope) if envelope.marker == marker => Ok(envelope.value),
        _ => Err(TaskError::CoroutineMisuse("Unexpected coroutine.resume()")),
    }
}

/// Scheduler-side: unwraps the payload handed back by a fiber's
/// [`FiberEvent::Yielded`](crate::fiber::FiberEvent::Yielded), returning the
/// marker to tag the eventual reply with plus the request value. Fails with
/// [`TaskError::CoroutineMisuse`] if the payload wasn't produced by
/// [`yield_suspend`] at all (a sign that user code called
/// [`crate::fiber::suspend`] directly, bypassing the marker protocol).
pub(crate) fn unwrap_request<Req: 'static>(
    payload: Box<dyn Any>,
) -> Result<(Marker, Req), TaskError> {
    payload
        .downcast::<Envelope<Req>>()
        .map(|envelope| (envelope.marker, envelope.value))
        .map_err(|_| TaskError::CoroutineMisuse("Unexpected coroutine.yield(...)"))
}

/// Scheduler-side: builds the reply payload to hand back into
/// [`crate::fiber::Fiber::resume`], tagged with the marker taken from the
/// matching request.
pub(crate) fn wrap_reply<Rep: 'static>(marker: Marker, value: Rep) -> Box<dyn Any> {
    Box::new(Envelope { marker, value })
}
