//! Collection of loop adapters.
//!
//! The coroutine core does not run any loop by itself: it posts its
//! callbacks through the [`Schedule`] installed on the current thread
//! (see [`crate::runtime::set_scheduler`]). Any event loop able to run
//! callbacks in FIFO order on its own thread can be plugged in.
//!
//! If you miss a loop matching your requirements, you can easily
//! implement your own by taking example on the existing ones. PRs are
//! welcomed!

/// A callback posted onto a loop.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// The thread-safe side of a loop.
pub trait Schedule: Send + Sync {
    /// Enqueues the given action, to be run on the loop thread after
    /// all previously posted ones.
    fn post(&self, action: Action);

    /// Requests the loop to return from its run at its next
    /// opportunity.
    fn stop(&self);
}

/// The loop itself, driven from its owning thread.
pub trait RunLoop {
    /// Returns the scheduler posting onto this loop.
    fn scheduler(&self) -> ::std::sync::Arc<dyn Schedule>;

    /// Runs posted actions until stopped or until no work remains.
    fn run(&self);
}

#[cfg(feature = "std")]
pub mod std;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(feature = "tokio")]
pub mod tokio;
