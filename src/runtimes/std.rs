//! The standard, blocking run loop.
//!
//! [`Looper`] runs posted actions in FIFO order on the thread calling
//! [`Looper::run`]. Delayed actions are kept in a timer heap and moved
//! to the queue once due. The loop returns when stopped, or when no
//! action, timer or [`Work`] guard remains.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    marker::PhantomData,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::{runtime, start_async, Awaitable};

use super::{Action, RunLoop, Schedule};

/// Identifies a delayed action, see [`LooperHandle::cancel`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ticket(u64);

struct Timer {
    deadline: Instant,
    ticket: Ticket,
    action: Action,
}

impl Timer {
    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.ticket.0)
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct State {
    actions: VecDeque<Action>,
    timers: BinaryHeap<Reverse<Timer>>,
    next_ticket: u64,
    work: usize,
    stopped: bool,
}

impl State {
    fn fire_due_timers(&mut self, now: Instant) {
        while self.timers.peek().map_or(false, |Reverse(t)| t.deadline <= now) {
            if let Some(Reverse(timer)) = self.timers.pop() {
                trace!("timer {:?} is due", timer.ticket);
                self.actions.push_back(timer.action);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.deadline)
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// The thread-safe handle of a [`Looper`].
#[derive(Clone, Default)]
pub struct LooperHandle {
    shared: Arc<Shared>,
}

impl LooperHandle {
    /// Posts an action to be run on the loop thread.
    pub fn post(&self, action: impl FnOnce() + Send + 'static) {
        self.push(Box::new(action))
    }

    fn push(&self, action: Action) {
        self.shared.state.lock().actions.push_back(action);
        self.shared.cond.notify_one();
    }

    /// Posts an action to be run once the given delay elapsed.
    pub fn post_after(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> Ticket {
        let mut state = self.shared.state.lock();

        state.next_ticket += 1;
        let ticket = Ticket(state.next_ticket);

        trace!("schedule timer {ticket:?} in {delay:?}");
        state.timers.push(Reverse(Timer {
            deadline: Instant::now() + delay,
            ticket,
            action: Box::new(action),
        }));

        drop(state);
        self.shared.cond.notify_one();

        ticket
    }

    /// Cancels a delayed action. Returns `false` if it already ran or
    /// was cancelled.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.shared.state.lock();
        let len = state.timers.len();
        state.timers.retain(|Reverse(t)| t.ticket != ticket);
        len != state.timers.len()
    }

    /// Requests the loop to stop.
    pub fn stop(&self) {
        debug!("request looper to stop");
        self.shared.state.lock().stopped = true;
        self.shared.cond.notify_all();
    }

    /// Keeps the loop running while the returned guard is alive, even
    /// without any queued action.
    pub fn work(&self) -> Work {
        self.shared.state.lock().work += 1;
        Work {
            shared: self.shared.clone(),
        }
    }

    /// Returns an awaitable completing once the given duration elapsed.
    ///
    /// Must be called on the loop thread. Racing it with
    /// [`crate::await_any`] implements a timeout. Cancelling the
    /// awaitable removes its timer from the loop.
    pub fn delay(&self, duration: Duration) -> Awaitable {
        let handle = self.clone();

        start_async(format!("delay-{}ms", duration.as_millis()), move || {
            let elapsed = Awaitable::new("elapsed");
            let completer = elapsed.take_completer();
            let ticket = handle.post_after(duration, move || completer.complete(()));

            let result = elapsed.wait();

            if result.is_err() && handle.cancel(ticket) {
                trace!("timer {ticket:?} removed");
            }

            result
        })
    }
}

impl Schedule for LooperHandle {
    fn post(&self, action: Action) {
        self.push(action)
    }

    fn stop(&self) {
        LooperHandle::stop(self)
    }
}

/// Keeps a [`Looper`] running while alive.
#[must_use]
pub struct Work {
    shared: Arc<Shared>,
}

impl Drop for Work {
    fn drop(&mut self) {
        self.shared.state.lock().work -= 1;
        self.shared.cond.notify_all();
    }
}

/// The standard run loop.
///
/// Creating a looper installs its handle as the scheduler of the
/// current thread. The looper itself stays on that thread.
pub struct Looper {
    handle: LooperHandle,
    _local: PhantomData<Rc<()>>,
}

impl Looper {
    pub fn new() -> Self {
        let handle = LooperHandle::default();
        runtime::set_scheduler(Arc::new(handle.clone()));

        Self {
            handle,
            _local: PhantomData,
        }
    }

    /// Returns a handle posting onto this looper.
    pub fn handle(&self) -> LooperHandle {
        self.handle.clone()
    }

    /// Runs posted actions until stopped or until no work remains.
    pub fn run(&self) {
        debug!("start looper");

        loop {
            let action = {
                let mut state = self.handle.shared.state.lock();

                loop {
                    if state.stopped {
                        state.stopped = false;
                        debug!("looper stopped");
                        return;
                    }

                    state.fire_due_timers(Instant::now());

                    if let Some(action) = state.actions.pop_front() {
                        break action;
                    }

                    match state.next_deadline() {
                        Some(deadline) => {
                            self.handle.shared.cond.wait_until(&mut state, deadline);
                        }
                        None if state.work > 0 => {
                            self.handle.shared.cond.wait(&mut state);
                        }
                        None => {
                            debug!("no more work, leave looper");
                            return;
                        }
                    }
                }
            };

            action();
        }
    }
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLoop for Looper {
    fn scheduler(&self) -> Arc<dyn Schedule> {
        Arc::new(self.handle.clone())
    }

    fn run(&self) {
        Looper::run(self)
    }
}
