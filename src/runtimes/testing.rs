//! A scheduler driven by hand, for tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::runtime;

use super::{Action, Schedule};

/// Records posted actions until a test runs them.
#[derive(Default)]
pub(crate) struct ManualScheduler {
    actions: Mutex<VecDeque<Action>>,
    posted: AtomicUsize,
}

impl ManualScheduler {
    /// Creates a scheduler and installs it on the current thread.
    pub(crate) fn install() -> Arc<Self> {
        let scheduler = Arc::new(Self::default());
        runtime::set_scheduler(scheduler.clone());
        scheduler
    }

    /// Returns the amount of actions posted so far.
    pub(crate) fn posted(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }

    /// Returns the amount of actions waiting to be run.
    pub(crate) fn pending(&self) -> usize {
        self.actions.lock().len()
    }

    /// Runs actions in order, including the ones they post, until the
    /// queue is empty. Returns the amount of actions run.
    pub(crate) fn run(&self) -> usize {
        let mut count = 0;

        loop {
            let action = self.actions.lock().pop_front();

            match action {
                Some(action) => action(),
                None => break count,
            }

            count += 1;
        }
    }
}

impl Schedule for ManualScheduler {
    fn post(&self, action: Action) {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.actions.lock().push_back(action);
    }

    fn stop(&self) {
        self.actions.lock().clear();
    }
}
