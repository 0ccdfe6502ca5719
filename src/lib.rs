//! Promises backed by work running on its own thread.
//!
//! A [`Promise`] settles exactly once, with a value or an error, and hands that
//! outcome to every caller of [`Promise::wait`], however many there are and
//! whenever they ask. Waits are bounded by a [`Context`]: when the context
//! fires the wait gives up with [`Error::Cancelled`], but the work keeps
//! running and a later wait can still observe its outcome.
//!
//! [`all`] waits on many promises at once, keeping their order and bailing out
//! on the first error.
//!
//! # Examples
//!
//! ```
//! use promise_all::{all_blocking, Context, Promise};
//!
//! let promises = vec![
//!     Promise::new(|| Ok::<_, std::io::Error>(1)),
//!     Promise::resolved(2),
//! ];
//! let values = all_blocking(&Context::background(), &promises).unwrap();
//! assert_eq!(values, vec![1, 2]);
//! ```
use std::{error::Error as StdError, io, sync::Arc};

mod all;
pub mod context;
pub mod promise;
mod wakers;

pub use all::{all, all_blocking};
pub use context::{Cancellation, Canceller, Context};
pub use promise::{Promise, Spawner, Wait};

/// An error produced by the work behind a promise, shared by every waiter.
pub type WorkError = Arc<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The wait was abandoned because its context fired. The promise itself
    /// is untouched.
    #[error(transparent)]
    Cancelled(#[from] Cancellation),
    /// The work returned an error.
    #[error("{0}")]
    Work(WorkError),
    #[error("work panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn thread: {0}")]
    Spawn(Arc<io::Error>),
}

impl Error {
    /// Wraps an error returned by work. One of our own errors, such as a
    /// cancellation the work ran into while waiting on another promise, is
    /// passed through as it is.
    pub fn work<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        match boxed.downcast::<Error>() {
            Ok(err) => *err,
            Err(other) => Error::Work(Arc::from(other)),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn cancellation(&self) -> Option<Cancellation> {
        match self {
            Error::Cancelled(cause) => Some(*cause),
            _ => None,
        }
    }

    pub fn work_error(&self) -> Option<&WorkError> {
        match self {
            Error::Work(err) => Some(err),
            _ => None,
        }
    }
}
