use std::{fmt, io};

use thiserror::Error;

/// Errors that can be returned from a suspension point or carried as
/// the result of an [`Awaitable`].
///
/// Structural misuse of the runtime (resuming a running coroutine,
/// taking a completer twice, etc.) is never reported through this
/// type: it panics.
///
/// [`Awaitable`]: crate::Awaitable
#[derive(Debug, Error)]
pub enum Error {
    /// The current coroutine is being torn down.
    ///
    /// Returned at the suspension point of a coroutine whose owner
    /// abandoned it. The body should clean up and return without
    /// suspending again.
    #[error("Coroutine forcibly unwound")]
    ForcedUnwind,

    /// The awaited operation was abandoned before it completed.
    #[error("Awaitable {0} cancelled before completion")]
    Cancelled(String),

    /// The coroutine stack could not be allocated.
    #[error("Cannot allocate coroutine stack")]
    Stack(#[source] io::Error),

    /// The awaited operation failed.
    #[error(transparent)]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Builds a [`Error::Failed`] from the given message.
    pub fn failed(msg: impl fmt::Display) -> Self {
        Self::Failed(msg.to_string().into())
    }

    /// Returns `true` if this is the cancellation signal.
    pub fn is_forced_unwind(&self) -> bool {
        matches!(self, Self::ForcedUnwind)
    }

    /// Returns `true` if the awaited operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// The result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
