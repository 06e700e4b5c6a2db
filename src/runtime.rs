//! Per-thread runtime state.
//!
//! Coroutines, awaitables and their bookkeeping never leave the thread
//! that created them. This module keeps, for the current thread:
//!
//! - the installed [`Schedule`] used to post callbacks onto the host
//!   loop,
//! - the stack of currently running coroutine contexts,
//! - weak registries used to resolve callbacks posted by completers
//!   and wake-ups back into live objects.
//!
//! Only [`set_scheduler`] and [`scheduler`] are public: run loops
//! call them to bind themselves to the thread they run on.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, trace};

use crate::{
    coro::{Context, CoroState},
    runtimes::{Action, Schedule},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static RUNTIME: Runtime = Runtime::default();
}

/// Something a completer callback can resolve to.
pub(crate) trait Deliver {
    fn deliver(&self);
}

#[derive(Default)]
struct Runtime {
    scheduler: RefCell<Option<Arc<dyn Schedule>>>,
    frames: RefCell<Vec<Rc<Context>>>,
    contexts: RefCell<HashMap<u64, Weak<Context>>>,
    targets: RefCell<HashMap<u64, Weak<dyn Deliver>>>,
    seq: Cell<u64>,
}

/// Installs the scheduler of the current thread.
///
/// Completers and wake-ups created on this thread post their
/// callbacks through it. Returns the previously installed scheduler.
pub fn set_scheduler(scheduler: Arc<dyn Schedule>) -> Option<Arc<dyn Schedule>> {
    debug!("install scheduler on current thread");
    RUNTIME.with(|rt| rt.scheduler.replace(Some(scheduler)))
}

/// Returns the scheduler installed on the current thread, if any.
pub fn scheduler() -> Option<Arc<dyn Schedule>> {
    RUNTIME.with(|rt| rt.scheduler.borrow().clone())
}

/// Posts the given action through the thread scheduler.
///
/// Panics if no scheduler has been installed.
pub(crate) fn post(action: Action) {
    let Some(scheduler) = scheduler() else {
        panic!("no scheduler installed on this thread, see runtime::set_scheduler");
    };

    scheduler.post(action)
}

/// Returns a unique id, shared by contexts and awaitables.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Returns the next completion sequence number of this thread.
pub(crate) fn next_seq() -> u64 {
    RUNTIME.with(|rt| {
        let seq = rt.seq.get() + 1;
        rt.seq.set(seq);
        seq
    })
}

/// Marks the given context as the innermost running one.
///
/// The context is popped when the returned frame is dropped. A frame
/// dropped without [`Frame::leave`] means the coroutine body panicked:
/// the context is then considered completed.
pub(crate) fn enter(ctx: Rc<Context>) -> Frame {
    RUNTIME.with(|rt| rt.frames.borrow_mut().push(ctx.clone()));
    Frame { ctx, armed: true }
}

pub(crate) struct Frame {
    ctx: Rc<Context>,
    armed: bool,
}

impl Frame {
    pub(crate) fn leave(mut self) {
        self.armed = false;
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let _ = RUNTIME.try_with(|rt| rt.frames.borrow_mut().pop());

        if self.armed {
            debug!("coroutine {} panicked", self.ctx);
            self.ctx.set_state(CoroState::Completed);
        }
    }
}

/// Returns the innermost running context.
pub(crate) fn current() -> Option<Rc<Context>> {
    RUNTIME.with(|rt| rt.frames.borrow().last().cloned())
}

pub(crate) fn register(ctx: &Rc<Context>) {
    RUNTIME.with(|rt| {
        let weak = Rc::downgrade(ctx);
        rt.contexts.borrow_mut().insert(ctx.id(), weak);
    })
}

pub(crate) fn forget(id: u64) {
    let _ = RUNTIME.try_with(|rt| rt.contexts.borrow_mut().remove(&id));
}

pub(crate) fn lookup(id: u64) -> Option<Rc<Context>> {
    RUNTIME.with(|rt| rt.contexts.borrow().get(&id).and_then(Weak::upgrade))
}

pub(crate) fn register_target(id: u64, target: Weak<dyn Deliver>) {
    RUNTIME.with(|rt| rt.targets.borrow_mut().insert(id, target));
}

pub(crate) fn forget_target(id: u64) {
    let _ = RUNTIME.try_with(|rt| rt.targets.borrow_mut().remove(&id));
}

/// Resolves a completion posted by a completer.
///
/// Runs on the loop thread. If the target awaitable has been dropped
/// meanwhile, nothing happens.
pub(crate) fn deliver(id: u64) {
    let target = RUNTIME.with(|rt| rt.targets.borrow().get(&id).and_then(Weak::upgrade));

    match target {
        Some(target) => target.deliver(),
        None => trace!("drop completion #{id}: awaitable is gone"),
    }
}
