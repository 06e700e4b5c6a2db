//! The Tokio-based run loop adapter.
//!
//! Posted actions are sent through an unbounded channel and run one
//! by one by a current-thread Tokio runtime, which also drives the
//! timers behind [`TokioHandle::delay`].

use std::{cell::RefCell, io, sync::Arc, time::Duration};

use log::{debug, trace};
use tokio::{
    runtime::{Builder, Handle, Runtime},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use crate::{start_async, Awaitable};

use super::{Action, RunLoop, Schedule};

enum Message {
    Run(Action),
    Stop,
}

/// The thread-safe handle of a [`TokioLoop`].
#[derive(Clone)]
pub struct TokioHandle {
    tx: UnboundedSender<Message>,
    rt: Handle,
}

impl TokioHandle {
    /// Posts an action to be run on the loop thread.
    pub fn post(&self, action: impl FnOnce() + Send + 'static) {
        self.send(Message::Run(Box::new(action)))
    }

    /// Requests the loop to stop.
    pub fn stop(&self) {
        debug!("request tokio loop to stop");
        self.send(Message::Stop)
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            trace!("tokio loop is gone, drop message");
        }
    }

    /// Returns an awaitable completing once the given duration elapsed.
    ///
    /// Must be called on the loop thread. Cancelling the awaitable
    /// aborts the underlying sleep.
    pub fn delay(&self, duration: Duration) -> Awaitable {
        let rt = self.rt.clone();

        start_async(format!("delay-{}ms", duration.as_millis()), move || {
            let elapsed = Awaitable::new("elapsed");
            let completer = elapsed.take_completer();

            let task = rt.spawn(async move {
                tokio::time::sleep(duration).await;
                completer.complete(());
            });

            let result = elapsed.wait();

            if result.is_err() {
                trace!("abort sleep of cancelled delay");
                task.abort();
            }

            result
        })
    }
}

impl Schedule for TokioHandle {
    fn post(&self, action: Action) {
        self.send(Message::Run(action))
    }

    fn stop(&self) {
        TokioHandle::stop(self)
    }
}

/// A run loop backed by a current-thread Tokio runtime.
///
/// Creating the loop installs its handle as the scheduler of the
/// current thread. Unlike [`super::std::Looper`], the loop only
/// returns once stopped.
pub struct TokioLoop {
    rt: Runtime,
    rx: RefCell<UnboundedReceiver<Message>>,
    handle: TokioHandle,
}

impl TokioLoop {
    pub fn new() -> io::Result<Self> {
        let rt = Builder::new_current_thread().enable_time().build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = TokioHandle {
            tx,
            rt: rt.handle().clone(),
        };

        crate::runtime::set_scheduler(Arc::new(handle.clone()));

        Ok(Self {
            rt,
            rx: RefCell::new(rx),
            handle,
        })
    }

    /// Returns a handle posting onto this loop.
    pub fn handle(&self) -> TokioHandle {
        self.handle.clone()
    }

    /// Runs posted actions until stopped.
    pub fn run(&self) {
        debug!("start tokio loop");

        let mut rx = self.rx.borrow_mut();

        self.rt.block_on(async {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Run(action) => action(),
                    Message::Stop => break,
                }
            }
        });

        debug!("tokio loop stopped");
    }
}

impl RunLoop for TokioLoop {
    fn scheduler(&self) -> Arc<dyn Schedule> {
        Arc::new(self.handle.clone())
    }

    fn run(&self) {
        TokioLoop::run(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::{
        await_any,
        runtimes::{RunLoop, Schedule},
        start_async,
    };

    use super::TokioLoop;

    #[test]
    fn delay_races_and_stops_loop() {
        let _ = env_logger::try_init();

        let looper = TokioLoop::new().unwrap();
        let handle = looper.handle();
        let scheduler = looper.scheduler();

        let start = Instant::now();

        let main = start_async("main", move || {
            let fast = handle.delay(Duration::from_millis(10));
            let slow = handle.delay(Duration::from_millis(500));
            let idx = await_any(&[&fast, &slow])?;
            scheduler.stop();
            Ok(idx)
        });

        RunLoop::run(&looper);

        assert_eq!(main.wait().unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
