use crate::context::{Context, Done};
use crate::wakers::Wakers;
use crate::Error;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::{future::Future, pin::Pin, task::{Context as TaskContext, Poll, Waker}, thread};

/// A value that some work will eventually produce. The handle may be cloned
/// and waited on from any number of threads; all of them see the same outcome.
///
/// # Examples
///
/// ```
/// use promise_all::{Context, Promise};
/// use std::thread;
///
/// let promise = Promise::new(|| Ok::<_, std::io::Error>(String::from("🍓")));
/// let other = promise.clone();
/// let task1 = thread::spawn(move || other.wait_blocking(&Context::background()));
/// assert_eq!(promise.wait_blocking(&Context::background()).unwrap(), "🍓");
/// assert_eq!(task1.join().expect("The task1 thread has panicked.").unwrap(), "🍓");
/// ```
pub struct Promise<T> {
    repr: Repr<T>,
}

enum Repr<T> {
    /// Backed by work that settles the cell when it finishes.
    Running(Arc<Settlement<T>>),
    Settled(Arc<Result<T, Error>>),
}

/// The shared cell a running promise settles into.
struct Settlement<T> {
    claimed: AtomicBool,
    outcome: OnceLock<Result<T, Error>>,
    wakers: Mutex<Wakers>,
}

impl<T> Settlement<T> {
    fn new() -> Self {
        Settlement {
            claimed: AtomicBool::new(false),
            outcome: OnceLock::new(),
            wakers: Mutex::new(Wakers::default()),
        }
    }

    /// Stores `outcome` and wakes every waiter, unless the cell has already
    /// been claimed. Returns whether this call won.
    fn settle(&self, outcome: Result<T, Error>) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("promise already settled, ignoring");
            return false;
        }
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        let wakers = self.wakers.lock().drain();
        for waker in wakers {
            waker.wake()
        }
        true
    }

    fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    fn reject(&self, err: Error) -> bool {
        self.settle(Err(err))
    }

    fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Returns the outcome if published, otherwise parks `waker` under `key`.
    fn poll_outcome(&self, key: &mut Option<u64>, waker: &Waker) -> Option<&Result<T, Error>> {
        if let Some(outcome) = self.outcome.get() {
            return Some(outcome);
        }
        let mut wakers = self.wakers.lock();
        // `settle` publishes before it drains, so checking again under the lock
        // means we either see the outcome or get woken.
        if let Some(outcome) = self.outcome.get() {
            return Some(outcome);
        }
        wakers.register(key, waker);
        None
    }

    fn forget(&self, key: u64) {
        self.wakers.lock().remove(key);
    }
}

#[cfg(test)]
impl<T> Promise<T> {
    /// How many `Wait`s are currently parked on this promise.
    pub(crate) fn parked_waiters(&self) -> usize {
        match &self.repr {
            Repr::Running(cell) => cell.wakers.lock().len(),
            Repr::Settled(_) => 0,
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Runs `work` on a new thread and returns a pending promise for its result.
    pub fn new<F, E>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Spawner::new().spawn(work)
    }
}

impl<T> Promise<T> {
    /// A promise that is already settled with `value`.
    pub fn resolved(value: T) -> Self {
        Promise { repr: Repr::Settled(Arc::new(Ok(value))) }
    }

    /// A promise that is already settled with `err`.
    pub fn rejected<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Promise { repr: Repr::Settled(Arc::new(Err(Error::work(err)))) }
    }

    /// Whether a wait would return without blocking.
    pub fn settled(&self) -> bool {
        match &self.repr {
            Repr::Running(cell) => cell.is_settled(),
            Repr::Settled(_) => true,
        }
    }

    /// Waits for the promise to settle or for `ctx` to fire, whichever comes
    /// first. An outcome that is already there is returned even if `ctx` has
    /// fired. Giving up leaves the promise and its work alone.
    pub fn wait<'a>(&'a self, ctx: &'a Context) -> Wait<'a, T> {
        Wait { promise: self, done: ctx.done(), key: None }
    }
}

impl<T: Clone> Promise<T> {
    /// The outcome, if the promise has settled.
    pub fn peek(&self) -> Option<Result<T, Error>> {
        match &self.repr {
            Repr::Running(cell) => cell.outcome.get().cloned(),
            Repr::Settled(outcome) => Some((**outcome).clone()),
        }
    }

    /// Blocks the current thread on [`Promise::wait`].
    pub fn wait_blocking(&self, ctx: &Context) -> Result<T, Error> {
        futures::executor::block_on(self.wait(ctx))
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        let repr = match &self.repr {
            Repr::Running(cell) => Repr::Running(cell.clone()),
            Repr::Settled(outcome) => Repr::Settled(outcome.clone()),
        };
        Promise { repr }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("settled", &self.settled()).finish()
    }
}

/// Future returned by [`Promise::wait`].
pub struct Wait<'a, T> {
    promise: &'a Promise<T>,
    done: Done<'a>,
    key: Option<u64>,
}

impl<T: Clone> Future for Wait<'_, T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let cell = match &this.promise.repr {
            Repr::Settled(outcome) => return Poll::Ready((**outcome).clone()),
            Repr::Running(cell) => cell,
        };
        if let Some(outcome) = cell.poll_outcome(&mut this.key, cx.waker()) {
            return Poll::Ready(outcome.clone());
        }
        match Pin::new(&mut this.done).poll(cx) {
            Poll::Ready(cause) => Poll::Ready(Err(Error::Cancelled(cause))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Wait<'_, T> {
    fn drop(&mut self) {
        if let (Some(key), Repr::Running(cell)) = (self.key.take(), &self.promise.repr) {
            cell.forget(key);
        }
    }
}

/// Configures the thread that runs a promise's work.
///
/// # Examples
///
/// ```
/// use promise_all::{Context, Spawner};
///
/// let promise = Spawner::new()
///     .name("answer")
///     .stack_size(64 * 1024)
///     .spawn(|| Ok::<_, std::io::Error>(42));
/// assert_eq!(promise.wait_blocking(&Context::background()).unwrap(), 42);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Spawner {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Spawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Starts `work` on a detached thread. The thread outlives any waiter and
    /// any handle; it settles the promise when `work` returns or panics. If the
    /// thread cannot be started the promise is rejected with [`Error::Spawn`].
    pub fn spawn<T, F, E>(&self, work: F) -> Promise<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let cell = Arc::new(Settlement::new());
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let settle = cell.clone();
        tracing::trace!(name = ?self.name, "spawning promise work");
        let spawned = builder.spawn(move || run(&*settle, work));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn promise work");
            cell.reject(Error::Spawn(Arc::new(err)));
        }
        Promise { repr: Repr::Running(cell) }
    }
}

fn run<T, F, E>(cell: &Settlement<T>, work: F)
where
    F: FnOnce() -> Result<T, E>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => cell.resolve(value),
        Ok(Err(err)) => cell.reject(Error::work(err)),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::warn!(panic = %msg, "promise work panicked");
            cell.reject(Error::Panicked(msg))
        }
    };
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
