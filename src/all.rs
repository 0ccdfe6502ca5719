//! Fan-in over many promises. Each promise gets its own waiter thread, and
//! the waiters report back over a single channel tagged with their slot.
use crate::{Context, Error, Promise};
use futures::{channel::mpsc, StreamExt};
use std::{iter, sync::Arc, thread};

/// Waits for every promise and returns their values in input order.
///
/// The first error to arrive, from whichever promise, is returned right away
/// and the remaining waits are cancelled. The promises themselves, and the
/// work behind them, are left to finish on their own.
///
/// # Examples
///
/// ```
/// use promise_all::{all, Context, Promise};
/// use futures::executor::block_on;
///
/// let promises = vec![Promise::resolved(42), Promise::rejected("doh!")];
/// let err = block_on(all(&Context::background(), &promises)).unwrap_err();
/// assert_eq!(err.to_string(), "doh!");
/// ```
pub async fn all<T>(ctx: &Context, promises: &[Promise<T>]) -> Result<Vec<T>, Error>
where
    T: Clone + Send + Sync + 'static,
{
    if promises.is_empty() {
        return Ok(Vec::new());
    }
    // Dropped on every return path, which cancels any waiter still running.
    let (ctx, _cancel) = Context::with_cancel(ctx);
    let (tx, mut rx) = mpsc::unbounded();

    for (slot, promise) in promises.iter().enumerate() {
        let promise = promise.clone();
        let ctx = ctx.clone();
        let tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("promise-all-{slot}"))
            .spawn(move || {
                let outcome = promise.wait_blocking(&ctx);
                // The receiver is gone once `all` has returned early.
                let _ = tx.unbounded_send((slot, outcome));
            });
        if let Err(err) = spawned {
            tracing::error!(slot, error = %err, "failed to spawn waiter");
            return Err(Error::Spawn(Arc::new(err)));
        }
    }
    drop(tx);

    let mut values: Vec<Option<T>> = iter::repeat_with(|| None).take(promises.len()).collect();
    while let Some((slot, outcome)) = rx.next().await {
        match outcome {
            Ok(value) => values[slot] = Some(value),
            Err(err) => {
                tracing::debug!(slot, error = %err, "promise failed, abandoning the rest");
                return Err(err);
            }
        }
    }
    values
        .into_iter()
        .collect::<Option<Vec<T>>>()
        .ok_or_else(|| Error::Panicked("waiter exited without reporting".to_owned()))
}

/// Blocks the current thread on [`all`].
pub fn all_blocking<T>(ctx: &Context, promises: &[Promise<T>]) -> Result<Vec<T>, Error>
where
    T: Clone + Send + Sync + 'static,
{
    futures::executor::block_on(all(ctx, promises))
}
