//! Stackful coroutine contexts.
//!
//! A [`Coroutine`] runs a body on its own stack. The body starts
//! immediately on the calling stack and runs until it calls
//! [`suspend`], at any depth of its call stack. Control then returns
//! to whoever started or resumed it.
//!
//! Contexts are asymmetric: a suspended coroutine always returns to
//! its resumer, which may itself be another coroutine. Dropping the
//! owner of a suspended coroutine forces it to unwind: its pending
//! [`suspend`] returns [`Error::ForcedUnwind`], and the body is
//! expected to clean up and return.

use std::{
    cell::{Cell, RefCell},
    fmt, ptr,
    rc::{Rc, Weak},
    thread,
};

use corosensei::{stack::DefaultStack, Coroutine as Fiber, CoroutineResult, Yielder};
use log::{debug, trace};

use crate::{runtime, Error, Result};

/// The value a context is resumed with.
pub(crate) enum Resume {
    Normal,
    Unwind,
}

/// The execution state of a coroutine context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoroState {
    /// Parked at a suspension point, waiting to be resumed.
    Suspended,

    /// Currently executing, or resuming another coroutine.
    Running,

    /// Executing its cleanup path after a forced unwind.
    Unwinding,

    /// The body returned.
    Completed,
}

pub(crate) struct Context {
    id: u64,
    name: String,
    state: Cell<CoroState>,
    ticket: Cell<u64>,
    yielder: Cell<*const Yielder<Resume, ()>>,
    fiber: RefCell<Fiber<Resume, (), ()>>,
}

impl Context {
    fn new(name: String, stack: DefaultStack, body: impl FnOnce() + 'static) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<Context>| {
            let weak = weak.clone();

            let fiber = Fiber::with_stack(stack, move |yielder: &Yielder<Resume, ()>, _: Resume| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.yielder.set(yielder as *const _);
                }

                body()
            });

            Self {
                id: runtime::next_id(),
                name,
                state: Cell::new(CoroState::Suspended),
                ticket: Cell::new(0),
                yielder: Cell::new(ptr::null()),
                fiber: RefCell::new(fiber),
            }
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> CoroState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: CoroState) {
        self.state.set(state)
    }

    /// Returns the waiter identifying the next suspension of this
    /// context.
    pub(crate) fn waiter(&self) -> Waiter {
        Waiter {
            coro: self.id,
            ticket: self.ticket.get() + 1,
        }
    }

    /// Transfers control into the context until it suspends again or
    /// completes.
    fn enter(self: &Rc<Self>, input: Resume) {
        let state = self.state.get();

        if state != CoroState::Suspended {
            panic!("cannot resume coroutine {self}: it is {state:?}");
        }

        self.state.set(match input {
            Resume::Normal => CoroState::Running,
            Resume::Unwind => CoroState::Unwinding,
        });

        let frame = runtime::enter(self.clone());
        let result = self.fiber.borrow_mut().resume(input);
        frame.leave();

        match result {
            CoroutineResult::Yield(()) => {
                self.state.set(CoroState::Suspended);
            }
            CoroutineResult::Return(()) => {
                debug!("coroutine {self} completed");
                self.state.set(CoroState::Completed);
            }
        }
    }

    /// Parks the context and returns control to its resumer.
    ///
    /// Must only be called on the innermost running context.
    pub(crate) fn suspend(&self) -> Result<()> {
        match self.state.get() {
            CoroState::Running => (),
            CoroState::Unwinding => panic!("coroutine {self} cannot suspend while unwinding"),
            state => panic!("coroutine {self} cannot suspend: it is {state:?}"),
        }

        let yielder = self.yielder.get();
        if yielder.is_null() {
            panic!("coroutine {self} cannot suspend before its body started");
        }

        self.ticket.set(self.ticket.get() + 1);
        trace!("suspend coroutine {self}");

        // SAFETY: the yielder lives on the coroutine stack for as long
        // as the body has not returned. The context is running, so its
        // body has started and not returned yet, and the caller
        // guarantees it is the innermost running context, so we are
        // executing on that very stack.
        let input = unsafe { &*yielder }.suspend(());

        match input {
            Resume::Normal => {
                trace!("resume coroutine {self}");
                Ok(())
            }
            Resume::Unwind => {
                debug!("unwind coroutine {self}");
                Err(Error::ForcedUnwind)
            }
        }
    }

    fn force_unwind(self: &Rc<Self>) {
        debug!("force unwind of coroutine {self}");
        self.enter(Resume::Unwind);
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        runtime::forget(self.id);
    }
}

/// The owner of a coroutine context.
///
/// A coroutine is started as soon as it is created. Dropping it while
/// suspended forces it to unwind before its stack is released.
pub struct Coroutine {
    ctx: Rc<Context>,
}

impl Coroutine {
    /// The stack size used by [`crate::Builder`] when none is given.
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

    /// Creates a coroutine with a default stack and runs `body` until
    /// its first suspension or completion.
    ///
    /// See [`Self::with_stack_size`] for a custom stack size.
    pub fn start(name: impl Into<String>, body: impl FnOnce() + 'static) -> Self {
        Self::with_stack(name.into(), DefaultStack::default(), body)
    }

    /// Creates a coroutine using a stack of the given size and runs
    /// `body` until its first suspension or completion.
    pub fn with_stack_size(
        name: impl Into<String>,
        stack_size: usize,
        body: impl FnOnce() + 'static,
    ) -> Result<Self> {
        let stack = DefaultStack::new(stack_size).map_err(Error::Stack)?;
        Ok(Self::with_stack(name.into(), stack, body))
    }

    pub(crate) fn with_stack(name: String, stack: DefaultStack, body: impl FnOnce() + 'static) -> Self {
        let ctx = Context::new(name, stack, body);
        debug!("start coroutine {ctx}");
        runtime::register(&ctx);
        ctx.enter(Resume::Normal);
        Self { ctx }
    }

    /// Resumes the suspended coroutine.
    ///
    /// Panics if the coroutine is not suspended.
    pub fn resume(&self) {
        self.ctx.enter(Resume::Normal)
    }

    /// Resumes the suspended coroutine with the cancellation signal and
    /// drives it to completion.
    ///
    /// Panics if the coroutine is not suspended, or if it tries to
    /// suspend again while unwinding.
    pub fn force_unwind(&self) {
        self.ctx.force_unwind()
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn state(&self) -> CoroState {
        self.ctx.state()
    }

    pub fn is_done(&self) -> bool {
        self.ctx.state() == CoroState::Completed
    }

    /// Returns a weak, thread-safe handle to this coroutine.
    pub fn handle(&self) -> CoroHandle {
        CoroHandle { id: self.ctx.id }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("name", &self.ctx.name)
            .field("id", &self.ctx.id)
            .field("state", &self.ctx.state())
            .finish()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        match self.ctx.state() {
            CoroState::Completed => (),
            CoroState::Suspended => self.ctx.force_unwind(),
            state if !thread::panicking() => {
                panic!("cannot destroy coroutine {}: it is {state:?}", self.ctx)
            }
            _ => (),
        }
    }
}

/// A weak handle to a coroutine.
///
/// The handle can be sent to other threads, but it can only be
/// resumed on the thread owning the coroutine, typically from a
/// callback posted onto the loop.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CoroHandle {
    id: u64,
}

impl CoroHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resumes the coroutine if it still exists and has not completed.
    ///
    /// Returns `false` without doing anything if the coroutine has been
    /// destroyed or has completed meanwhile. Panics if it is running.
    pub fn resume(self) -> bool {
        let Some(ctx) = runtime::lookup(self.id) else {
            trace!("cannot resume coroutine #{}: it is gone", self.id);
            return false;
        };

        if ctx.state() == CoroState::Completed {
            trace!("cannot resume coroutine {ctx}: it completed");
            return false;
        }

        ctx.enter(Resume::Normal);
        true
    }

    /// Returns `true` if the coroutine exists and has not completed.
    pub fn is_alive(self) -> bool {
        runtime::lookup(self.id).map_or(false, |ctx| ctx.state() != CoroState::Completed)
    }
}

/// Returns a handle to the innermost running coroutine.
pub fn current() -> Option<CoroHandle> {
    runtime::current().map(|ctx| CoroHandle { id: ctx.id })
}

/// Suspends the innermost running coroutine.
///
/// Returns `Ok(())` once resumed normally, or
/// [`Error::ForcedUnwind`] if the coroutine is being torn down. Panics
/// when called outside of a coroutine, or while unwinding.
pub fn suspend() -> Result<()> {
    let Some(ctx) = runtime::current() else {
        panic!("cannot suspend outside of a coroutine");
    };

    ctx.suspend()
}

/// Identifies one suspension of one coroutine.
///
/// Wake-ups carry the waiter they were issued for, so that a wake-up
/// arriving after the coroutine moved on is ignored.
#[doc(hidden)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Waiter {
    coro: u64,
    ticket: u64,
}

impl Waiter {
    pub(crate) fn coro(&self) -> u64 {
        self.coro
    }
}

/// Resumes the coroutine behind the given waiter.
///
/// From the loop's own stack the waiter is resumed directly. From
/// inside a coroutine the wake-up is posted, as the waiter may own the
/// running coroutine.
pub(crate) fn wake(waiter: Waiter) {
    if runtime::current().is_some() {
        trace!("post wake-up of coroutine #{}", waiter.coro);
        runtime::post(Box::new(move || resume_waiter(waiter)));
    } else {
        resume_waiter(waiter);
    }
}

fn resume_waiter(waiter: Waiter) {
    let Some(ctx) = runtime::lookup(waiter.coro) else {
        trace!("ignore wake-up of coroutine #{}: it is gone", waiter.coro);
        return;
    };

    if ctx.state() == CoroState::Suspended && ctx.ticket.get() == waiter.ticket {
        ctx.enter(Resume::Normal);
    } else {
        trace!("ignore stale wake-up of coroutine {ctx}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use crate::Error;

    use super::{current, suspend, CoroState, Coroutine};

    #[test]
    fn start_runs_until_first_suspension() {
        let _ = env_logger::try_init();

        let step = Rc::new(Cell::new(0));

        let coro = Coroutine::start("steps", {
            let step = step.clone();
            move || {
                step.set(1);
                suspend().unwrap();
                step.set(2);
                suspend().unwrap();
                step.set(3);
            }
        });

        assert_eq!(step.get(), 1);
        assert_eq!(coro.state(), CoroState::Suspended);

        coro.resume();
        assert_eq!(step.get(), 2);

        coro.resume();
        assert_eq!(step.get(), 3);
        assert!(coro.is_done());
    }

    #[test]
    fn body_without_suspension_completes_on_start() {
        let _ = env_logger::try_init();

        let coro = Coroutine::start("eager", || ());
        assert!(coro.is_done());
    }

    #[test]
    fn suspend_deep_in_call_stack() {
        let _ = env_logger::try_init();

        fn recurse(depth: usize, trail: &RefCell<Vec<usize>>) {
            if depth == 0 {
                suspend().unwrap();
                return;
            }

            trail.borrow_mut().push(depth);
            recurse(depth - 1, trail);
            trail.borrow_mut().push(depth);
        }

        let trail = Rc::new(RefCell::new(Vec::new()));

        let coro = Coroutine::start("deep", {
            let trail = trail.clone();
            move || recurse(3, &trail)
        });

        assert_eq!(*trail.borrow(), vec![3, 2, 1]);

        coro.resume();
        assert_eq!(*trail.borrow(), vec![3, 2, 1, 1, 2, 3]);
    }

    #[test]
    fn force_unwind_reports_signal_at_suspension_point() {
        let _ = env_logger::try_init();

        let seen = Rc::new(RefCell::new(None));

        let coro = Coroutine::start("unwound", {
            let seen = seen.clone();
            move || {
                let err = suspend().unwrap_err();
                seen.replace(Some(matches!(err, Error::ForcedUnwind)));
            }
        });

        coro.force_unwind();

        assert_eq!(*seen.borrow(), Some(true));
        assert!(coro.is_done());
    }

    #[test]
    fn drop_suspended_coroutine_runs_cleanup() {
        let _ = env_logger::try_init();

        let cleaned = Rc::new(Cell::new(false));

        let coro = Coroutine::start("abandoned", {
            let cleaned = cleaned.clone();
            move || {
                if suspend().is_err() {
                    cleaned.set(true);
                }
            }
        });

        assert!(!cleaned.get());
        drop(coro);
        assert!(cleaned.get());
    }

    #[test]
    fn nested_coroutines_return_to_their_resumer() {
        let _ = env_logger::try_init();

        let trail = Rc::new(RefCell::new(Vec::new()));

        let outer = Coroutine::start("outer", {
            let trail = trail.clone();
            move || {
                let outer_id = current().unwrap();
                trail.borrow_mut().push("outer");

                let inner = Coroutine::start("inner", {
                    let trail = trail.clone();
                    move || {
                        assert_ne!(current().unwrap(), outer_id);
                        trail.borrow_mut().push("inner");
                        suspend().unwrap();
                        trail.borrow_mut().push("inner resumed");
                    }
                });

                assert_eq!(current().unwrap(), outer_id);
                trail.borrow_mut().push("outer again");
                suspend().unwrap();
                inner.resume();
            }
        });

        assert_eq!(*trail.borrow(), vec!["outer", "inner", "outer again"]);
        assert!(current().is_none());

        outer.resume();
        assert_eq!(
            *trail.borrow(),
            vec!["outer", "inner", "outer again", "inner resumed"]
        );
        assert!(outer.is_done());
    }

    #[test]
    fn handle_of_destroyed_coroutine_is_noop() {
        let _ = env_logger::try_init();

        let coro = Coroutine::start("gone", || {
            let _ = suspend();
        });

        let handle = coro.handle();
        assert!(handle.is_alive());

        drop(coro);

        assert!(!handle.is_alive());
        assert!(!handle.resume());
    }

    #[test]
    fn handle_resumes_suspended_coroutine() {
        let _ = env_logger::try_init();

        let coro = Coroutine::start("handled", || suspend().unwrap());

        assert!(coro.handle().resume());
        assert!(coro.is_done());
        assert!(!coro.handle().resume());
    }

    #[test]
    #[should_panic(expected = "cannot suspend outside of a coroutine")]
    fn suspend_outside_coroutine_panics() {
        let _ = suspend();
    }

    #[test]
    #[should_panic(expected = "cannot resume coroutine")]
    fn resume_completed_coroutine_panics() {
        let coro = Coroutine::start("done", || ());
        coro.resume();
    }

    #[test]
    #[should_panic(expected = "cannot suspend while unwinding")]
    fn suspend_while_unwinding_panics() {
        let coro = Coroutine::start("stubborn", || {
            let _ = suspend();
            let _ = suspend();
        });

        coro.force_unwind();
    }
}
