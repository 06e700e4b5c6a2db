//! Thread-safe completion tokens.
//!
//! A [`Completer`] is the only way for code running outside the
//! coroutine world (typically an offloaded OS thread) to complete an
//! [`Awaitable`]. It never touches the awaitable directly: it stores
//! the value in a small shared slot and posts a delivery callback
//! through the loop scheduler. The callback then resolves the
//! awaitable on the loop thread, if it still exists.
//!
//! [`Awaitable`]: crate::Awaitable

use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use log::trace;
use parking_lot::Mutex;

use crate::{runtime, runtimes::Schedule, Error, Result};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const REVOKED: u8 = 2;

/// The completion slot shared by an awaitable and its completers.
pub(crate) struct Slot<T> {
    id: u64,
    state: AtomicU8,
    value: Mutex<Option<Result<T>>>,
}

impl<T> Slot<T> {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(PENDING),
            value: Mutex::new(None),
        }
    }

    /// Prevents any further delivery.
    pub(crate) fn revoke(&self) {
        self.state.store(REVOKED, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Option<Result<T>> {
        self.value.lock().take()
    }
}

/// A weak handle able to complete one awaitable, once.
///
/// Completers are cheap to clone and can be sent across threads. The
/// first completion among all clones wins. Completing after the
/// awaitable was completed, cancelled or dropped does nothing.
pub struct Completer<T = ()> {
    slot: Arc<Slot<T>>,
    scheduler: Arc<dyn Schedule>,
}

impl<T: Send + 'static> Completer<T> {
    pub(crate) fn new(slot: Arc<Slot<T>>, scheduler: Arc<dyn Schedule>) -> Self {
        Self { slot, scheduler }
    }

    /// Completes the awaitable with the given value.
    pub fn complete(&self, value: T) {
        self.send(Ok(value))
    }

    /// Completes the awaitable with the given error.
    pub fn fail(&self, err: Error) {
        self.send(Err(err))
    }

    /// Returns `true` if a completion can still be delivered.
    pub fn is_valid(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) == PENDING
    }

    fn send(&self, result: Result<T>) {
        let id = self.slot.id;
        let fired = self
            .slot
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire);

        if fired.is_err() {
            trace!("ignore stale completion #{id}");
            return;
        }

        *self.slot.value.lock() = Some(result);

        trace!("post completion #{id}");
        self.scheduler.post(Box::new(move || runtime::deliver(id)));
    }
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.slot.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "revoked",
        };

        f.debug_struct("Completer")
            .field("id", &self.slot.id)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        thread,
    };

    use crate::{runtimes::testing::ManualScheduler, start_async, Awaitable, Error};

    #[test]
    fn first_completion_wins() {
        let _ = env_logger::try_init();

        let scheduler = ManualScheduler::install();

        let evt = Awaitable::<u32>::new("evt");
        let completer = evt.take_completer();
        let clone = completer.clone();

        completer.complete(1);
        clone.complete(2);
        completer.fail(Error::failed("too late"));

        assert!(!clone.is_valid());
        assert_eq!(scheduler.posted(), 1);

        scheduler.run();
        assert_eq!(evt.wait().unwrap(), 1);
    }

    #[test]
    fn fail_surfaces_error() {
        let _ = env_logger::try_init();

        let scheduler = ManualScheduler::install();

        let evt = Awaitable::<u32>::new("evt");
        let completer = evt.take_completer();

        let waiter = start_async("waiter", move || evt.wait());

        thread::spawn(move || completer.fail(Error::failed("boom")))
            .join()
            .unwrap();

        scheduler.run();

        assert!(waiter.did_fail());
        let err = waiter.wait().unwrap_err();
        assert!(matches!(err, Error::Failed(_)));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn completion_after_drop_is_noop_from_many_threads() {
        let _ = env_logger::try_init();

        let scheduler = ManualScheduler::install();

        let evt = Awaitable::<u32>::new("evt");
        let completer = evt.take_completer();
        drop(evt);

        assert!(!completer.is_valid());

        let threads: Vec<_> = (0..8)
            .map(|n| {
                let completer = completer.clone();
                thread::spawn(move || {
                    completer.complete(n);
                    completer.fail(Error::failed("late"));
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(scheduler.posted(), 0);
        assert_eq!(scheduler.run(), 0);
    }

    #[test]
    fn completion_posted_before_drop_is_ignored() {
        let _ = env_logger::try_init();

        let scheduler = ManualScheduler::install();

        let evt = Awaitable::<u32>::new("evt");
        let completer = Arc::new(evt.take_completer());

        let sender = completer.clone();
        thread::spawn(move || sender.complete(7)).join().unwrap();
        assert_eq!(scheduler.posted(), 1);

        drop(evt);

        // the delivery callback finds nothing to complete
        assert_eq!(scheduler.run(), 1);
        assert!(!completer.is_valid());
    }

    #[test]
    fn detached_thread_completing_late_is_noop() {
        let _ = env_logger::try_init();

        let scheduler = ManualScheduler::install();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        let op = start_async("op", move || {
            let evt = Awaitable::<u32>::new("evt");
            let completer = evt.take_completer();

            let worker = thread::spawn(move || {
                let _ = go_rx.recv();
                completer.complete(1);
                let _ = done_tx.send(completer.is_valid());
            });

            match evt.wait() {
                Err(err) => {
                    // the worker cannot be interrupted, let it go
                    drop(worker);
                    Err(err)
                }
                result => result,
            }
        });

        drop(op);

        go_tx.send(()).unwrap();
        assert!(!done_rx.recv().unwrap());

        assert_eq!(scheduler.posted(), 0);
        assert_eq!(scheduler.run(), 0);
    }
}
