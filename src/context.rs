//! A `Context` carries a one-way cancellation signal, optionally tied to a
//! deadline. Contexts form a tree: cancelling a parent cancels every context
//! derived from it, never the other way round.
//!
//! The tree itself is a [`CancellationToken`]; a context adds the cause it
//! fired with and the deadline that fires it.
//!
//! # Examples
//!
//! ```
//! use promise_all::context::{Cancellation, Context};
//! use std::time::Duration;
//!
//! let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_millis(10));
//! let cause = futures::executor::block_on(ctx.done());
//! assert_eq!(cause, Cancellation::DeadlineExceeded);
//! ```
use futures::task::{waker, ArcWake};
use std::{
    future::Future,
    pin::{pin, Pin},
    sync::{Arc, OnceLock},
    task::{Context as TaskContext, Poll},
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why a context fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Cancellation {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Node>,
}

#[derive(Debug)]
struct Node {
    token: CancellationToken,
    cause: OnceLock<Cancellation>,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cancels the context it was created with. Dropping it cancels too, so hold
/// on to it for as long as the context should stay live.
#[derive(Debug)]
#[must_use = "dropping a Canceller cancels its context immediately"]
pub struct Canceller {
    ctx: Context,
}

impl Context {
    /// The root context. It is never cancelled and has no deadline.
    pub fn background() -> Self {
        Context {
            inner: Arc::new(Node {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                deadline: None,
                parent: None,
            }),
        }
    }

    pub fn with_cancel(parent: &Context) -> (Context, Canceller) {
        let child = parent.derive(parent.inner.deadline);
        let canceller = Canceller { ctx: child.clone() };
        (child, canceller)
    }

    /// Derives a context that fires with [`Cancellation::DeadlineExceeded`]
    /// once `deadline` passes. A parent deadline that comes sooner wins.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, Canceller) {
        let own_is_sooner = parent.inner.deadline.map_or(true, |d| deadline < d);
        if !own_is_sooner {
            return Context::with_cancel(parent);
        }
        let child = parent.derive(Some(deadline));
        let canceller = Canceller { ctx: child.clone() };
        if deadline <= Instant::now() {
            child.cancel_with(Cancellation::DeadlineExceeded);
            return (child, canceller);
        }

        let timer = child.clone();
        let spawned = thread::Builder::new()
            .name("context-deadline".into())
            .spawn(move || timer.watch(deadline));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to start deadline timer, failing context closed");
            child.cancel_with(Cancellation::DeadlineExceeded);
        }
        (child, canceller)
    }

    /// Like [`Context::with_deadline`]. A timeout too large to land on the
    /// clock leaves the context without a deadline.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, Canceller) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Context::with_deadline(parent, deadline),
            None => Context::with_cancel(parent),
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> Context {
        Context {
            inner: Arc::new(Node {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                deadline,
                parent: Some(self.clone()),
            }),
        }
    }

    fn cancel_with(&self, cause: Cancellation) {
        // A context already cancelled from above keeps the inherited cause.
        if !self.inner.token.is_cancelled() {
            let _ = self.inner.cause.set(cause);
        }
        self.inner.token.cancel();
    }

    /// Sleeps until `deadline`, waking early if the context is cancelled first.
    fn watch(&self, deadline: Instant) {
        let waker = waker(Arc::new(Unpark(thread::current())));
        let mut cx = TaskContext::from_waker(&waker);
        let mut cancelled = pin!(self.inner.token.cancelled());
        loop {
            if cancelled.as_mut().poll(&mut cx).is_ready() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        self.cancel_with(Cancellation::DeadlineExceeded);
    }

    /// Why this context fired, or `None` while it is still live.
    pub fn err(&self) -> Option<Cancellation> {
        if !self.inner.token.is_cancelled() {
            return None;
        }
        let mut node = &self.inner;
        loop {
            if let Some(cause) = node.cause.get() {
                return Some(*cause);
            }
            match &node.parent {
                Some(parent) => node = &parent.inner,
                None => return Some(Cancellation::Canceled),
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// A future that completes with the cause once this context fires.
    pub fn done(&self) -> Done<'_> {
        Done {
            ctx: self,
            cancelled: Box::pin(self.inner.token.cancelled()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::background()
    }
}

impl Canceller {
    pub fn cancel(&self) {
        self.ctx.cancel_with(Cancellation::Canceled);
    }
}

impl Drop for Canceller {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Unpark(thread::Thread);

impl ArcWake for Unpark {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Future returned by [`Context::done`].
pub struct Done<'a> {
    ctx: &'a Context,
    cancelled: Pin<Box<WaitForCancellationFuture<'a>>>,
}

impl Future for Done<'_> {
    type Output = Cancellation;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.cancelled.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(this.ctx.err().unwrap_or(Cancellation::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
use super::{Cancellation, Context};
use crate::{Error, Promise};
use futures::executor::block_on;
use std::{thread, time::{Duration, Instant}};

#[test]
fn test_background_never_fires() {
    let ctx = Context::background();
    assert_eq!(ctx.err(), None);
    assert_eq!(ctx.deadline(), None);
}

#[test]
fn test_cancel_wakes_done() {
    let (ctx, cancel) = Context::with_cancel(&Context::background());
    let waiter = ctx.clone();
    let task = thread::spawn(move || block_on(waiter.done()));
    thread::sleep(Duration::from_millis(10));
    cancel.cancel();
    assert_eq!(task.join().expect("The waiter thread has panicked"), Cancellation::Canceled);
    assert!(ctx.is_done());
}

#[test]
fn test_drop_canceller_cancels() {
    let (ctx, cancel) = Context::with_cancel(&Context::background());
    drop(cancel);
    assert_eq!(ctx.err(), Some(Cancellation::Canceled));
}

#[test]
fn test_parent_cancel_propagates() {
    let (parent, cancel) = Context::with_cancel(&Context::background());
    let (child, _child_cancel) = Context::with_cancel(&parent);
    let (grandchild, _grandchild_cancel) = Context::with_timeout(&child, Duration::from_secs(60));
    cancel.cancel();
    assert_eq!(child.err(), Some(Cancellation::Canceled));
    assert_eq!(grandchild.err(), Some(Cancellation::Canceled));
}

#[test]
fn test_cancel_after_parent_handle_dropped() {
    let (parent, cancel) = Context::with_cancel(&Context::background());
    let (child, _child_cancel) = Context::with_cancel(&parent);
    drop(parent);
    cancel.cancel();
    assert_eq!(child.err(), Some(Cancellation::Canceled));
}

#[test]
fn test_cancel_skips_dropped_middle_context() {
    let (root, cancel) = Context::with_cancel(&Context::background());
    let (mid, _mid_cancel) = Context::with_cancel(&root);
    let (leaf, _leaf_cancel) = Context::with_cancel(&mid);
    drop(mid);

    let promise = Promise::new(|| {
        thread::sleep(Duration::from_secs(2));
        Ok::<_, Error>(1)
    });
    let waiter = thread::spawn(move || promise.wait_blocking(&leaf));
    thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    let err = waiter.join().expect("The waiter thread has panicked").unwrap_err();
    assert_eq!(err.cancellation(), Some(Cancellation::Canceled));
}

#[test]
fn test_child_cancel_leaves_parent_live() {
    let (parent, _cancel) = Context::with_cancel(&Context::background());
    let (child, child_cancel) = Context::with_cancel(&parent);
    child_cancel.cancel();
    assert!(child.is_done());
    assert!(!parent.is_done());
}

#[test]
fn test_child_of_cancelled_parent_starts_cancelled() {
    let (parent, cancel) = Context::with_cancel(&Context::background());
    cancel.cancel();
    let (child, _child_cancel) = Context::with_cancel(&parent);
    assert_eq!(child.err(), Some(Cancellation::Canceled));
}

#[test]
fn test_deadline_exceeded() {
    let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_millis(20));
    assert!(!ctx.is_done());
    assert_eq!(block_on(ctx.done()), Cancellation::DeadlineExceeded);
}

#[test]
fn test_past_deadline_fires_immediately() {
    let (ctx, _cancel) = Context::with_deadline(&Context::background(), Instant::now());
    assert_eq!(ctx.err(), Some(Cancellation::DeadlineExceeded));
}

#[test]
fn test_unbounded_timeout_has_no_deadline() {
    let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::MAX);
    assert_eq!(ctx.deadline(), None);
    assert!(!ctx.is_done());
}

#[test]
fn test_parent_deadline_wins_when_sooner() {
    let (parent, _cancel) = Context::with_timeout(&Context::background(), Duration::from_millis(20));
    let (child, _child_cancel) = Context::with_timeout(&parent, Duration::from_secs(60));
    assert_eq!(child.deadline(), parent.deadline());
    assert_eq!(block_on(child.done()), Cancellation::DeadlineExceeded);
}

#[test]
fn test_cancel_before_deadline_keeps_cause() {
    let (ctx, cancel) = Context::with_timeout(&Context::background(), Duration::from_millis(20));
    cancel.cancel();
    thread::sleep(Duration::from_millis(40));
    assert_eq!(ctx.err(), Some(Cancellation::Canceled));
}
}
