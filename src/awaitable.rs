//! Awaitables, handles to operations completing later.
//!
//! An [`Awaitable`] is either driven by its own coroutine (see
//! [`start_async`] and [`Builder`]), completing when the body returns,
//! or created pending with [`Awaitable::new`] and completed from
//! anywhere through its [`Completer`].
//!
//! Waiting on an awaitable suspends the calling coroutine. Dropping a
//! pending awaitable cancels it: its coroutine, if any, is forced to
//! unwind before the drop returns.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};

use corosensei::stack::DefaultStack;
use log::{debug, trace};

use crate::{
    completer::{Completer, Slot},
    coro::{self, CoroState, Coroutine, Waiter},
    runtime::{self, Deliver},
    Error, Result,
};

/// The state of an awaitable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AwaitState {
    /// The operation has not completed yet.
    Pending,

    /// The operation is being abandoned, its coroutine is unwinding.
    Cancelling,

    /// The result is available. Terminal.
    Completed,
}

struct Core<T> {
    id: u64,
    name: String,
    state: Cell<AwaitState>,
    failed: Cell<bool>,
    seq: Cell<Option<u64>>,
    result: RefCell<Option<Result<T>>>,
    awaiter: Cell<Option<Waiter>>,
    coroutine: RefCell<Option<Coroutine>>,
    slot: RefCell<Option<Arc<Slot<T>>>>,
}

impl<T> Core<T> {
    fn new(name: String) -> Self {
        Self {
            id: runtime::next_id(),
            name,
            state: Cell::new(AwaitState::Pending),
            failed: Cell::new(false),
            seq: Cell::new(None),
            result: RefCell::new(None),
            awaiter: Cell::new(None),
            coroutine: RefCell::new(None),
            slot: RefCell::new(None),
        }
    }

    fn complete(&self, result: Result<T>) {
        if self.state.get() == AwaitState::Completed {
            return;
        }

        match &result {
            Ok(_) => debug!("awaitable {} completed", self.name),
            Err(err) => debug!("awaitable {} completed with error: {err}", self.name),
        }

        self.failed.set(result.is_err());
        self.result.replace(Some(result));
        self.seq.set(Some(runtime::next_seq()));
        self.state.set(AwaitState::Completed);
        self.revoke();

        if let Some(waiter) = self.awaiter.take() {
            coro::wake(waiter);
        }
    }

    /// Stores the result returned by the coroutine body.
    fn finish(&self, result: Result<T>) {
        match self.state.get() {
            AwaitState::Pending => self.complete(result),
            state => trace!("discard result of awaitable {} ({state:?})", self.name),
        }
    }

    fn cancel(&self) {
        if self.state.get() != AwaitState::Pending {
            return;
        }

        debug!("cancel awaitable {}", self.name);
        self.state.set(AwaitState::Cancelling);
        self.revoke();

        if let Some(coroutine) = self.coroutine.borrow().as_ref() {
            match coroutine.state() {
                CoroState::Suspended => coroutine.force_unwind(),
                CoroState::Completed => (),
                state => panic!(
                    "cannot cancel awaitable {}: its coroutine is {state:?}",
                    self.name
                ),
            }
        }

        self.complete(Err(Error::Cancelled(self.name.clone())));
    }

    fn revoke(&self) {
        if let Some(slot) = self.slot.borrow().as_ref() {
            slot.revoke();
        }
    }

    fn take_result(&self) -> Result<T> {
        match self.result.borrow_mut().take() {
            Some(result) => result,
            None => panic!("result of awaitable {} already taken", self.name),
        }
    }

    fn set_awaiter(&self, waiter: Waiter) {
        if let Some(awaiter) = self.awaiter.get() {
            if awaiter.coro() != waiter.coro() {
                panic!("awaitable {} is already awaited by another coroutine", self.name);
            }
        }

        self.awaiter.set(Some(waiter));
    }

    fn clear_awaiter(&self, waiter: Waiter) {
        if let Some(awaiter) = self.awaiter.get() {
            if awaiter.coro() == waiter.coro() {
                self.awaiter.set(None);
            }
        }
    }
}

impl<T> Deliver for Core<T> {
    fn deliver(&self) {
        let result = self.slot.borrow().as_ref().and_then(|slot| slot.take());

        let Some(result) = result else {
            return;
        };

        match self.state.get() {
            AwaitState::Pending => self.complete(result),
            state => trace!("drop late completion of awaitable {} ({state:?})", self.name),
        }
    }
}

/// A handle to an operation completing later.
///
/// The awaitable owns its coroutine, if any. It can be awaited by at
/// most one coroutine at a time.
pub struct Awaitable<T = ()> {
    core: Rc<Core<T>>,
}

impl<T: 'static> Awaitable<T> {
    /// Creates a pending awaitable, to be completed through the
    /// completer returned by [`Self::take_completer`].
    pub fn new(name: impl Into<String>) -> Self {
        let core = Core::new(name.into());
        trace!("create awaitable {}", core.name);
        Self {
            core: Rc::new(core),
        }
    }

    /// Returns the completer of this awaitable.
    ///
    /// Panics if called twice, after completion, on an awaitable driven
    /// by a coroutine, or when no scheduler is installed on this
    /// thread.
    pub fn take_completer(&self) -> Completer<T>
    where
        T: Send,
    {
        let core = &self.core;

        if core.coroutine.borrow().is_some() {
            panic!("cannot take completer of awaitable {}: it is driven by a coroutine", core.name);
        }

        if core.state.get() != AwaitState::Pending {
            panic!("cannot take completer of awaitable {}: it completed", core.name);
        }

        if core.slot.borrow().is_some() {
            panic!("completer of awaitable {} already taken", core.name);
        }

        let Some(scheduler) = runtime::scheduler() else {
            panic!("cannot take completer of awaitable {}: no scheduler installed", core.name);
        };

        let slot = Arc::new(Slot::new(core.id));
        core.slot.replace(Some(slot.clone()));

        let target: Weak<Core<T>> = Rc::downgrade(&self.core);
        runtime::register_target(core.id, target);

        Completer::new(slot, scheduler)
    }
}

impl<T> Awaitable<T> {
    /// Suspends the calling coroutine until this awaitable completes,
    /// then returns its result.
    ///
    /// Returns immediately if the awaitable already completed, even
    /// outside of a coroutine. If the calling coroutine is torn down
    /// while waiting, this awaitable is cancelled and
    /// [`Error::ForcedUnwind`] is returned.
    ///
    /// The result can be taken only once.
    pub fn wait(&self) -> Result<T> {
        loop {
            if self.core.state.get() == AwaitState::Completed {
                return self.core.take_result();
            }

            let Some(ctx) = runtime::current() else {
                panic!("cannot wait on pending awaitable {} outside of a coroutine", self.core.name);
            };

            if let Some(coroutine) = self.core.coroutine.borrow().as_ref() {
                if coroutine.handle().id() == ctx.id() {
                    panic!("awaitable {} cannot wait on itself", self.core.name);
                }
            }

            let waiter = ctx.waiter();
            self.core.set_awaiter(waiter);
            trace!("wait on awaitable {}", self.core.name);
            let resumed = ctx.suspend();
            self.core.clear_awaiter(waiter);

            if let Err(err) = resumed {
                self.core.cancel();
                return Err(err);
            }
        }
    }

    /// Abandons the operation.
    ///
    /// A pending awaitable is marked cancelling, its coroutine is
    /// forced to unwind synchronously, then it completes with
    /// [`Error::Cancelled`]. Does nothing on a completed awaitable.
    pub fn cancel(&self) {
        self.core.cancel()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> AwaitState {
        self.core.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.core.state.get() == AwaitState::Completed
    }

    /// Returns `true` if the awaitable completed with an error,
    /// including cancellation.
    pub fn did_fail(&self) -> bool {
        self.core.failed.get()
    }
}

impl<T> Drop for Awaitable<T> {
    fn drop(&mut self) {
        if self.core.state.get() == AwaitState::Pending {
            self.core.cancel();
        }

        if self.core.slot.borrow().is_some() {
            runtime::forget_target(self.core.id);
        }
    }
}

impl<T> fmt::Debug for Awaitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaitable")
            .field("name", &self.core.name)
            .field("state", &self.core.state.get())
            .finish()
    }
}

/// The type-erased side of an awaitable, used by combinators.
pub trait Waitable {
    fn name(&self) -> &str;

    fn is_done(&self) -> bool;

    fn cancel(&self);

    #[doc(hidden)]
    fn completion_seq(&self) -> Option<u64>;

    #[doc(hidden)]
    fn register_waiter(&self, waiter: Waiter);

    #[doc(hidden)]
    fn unregister_waiter(&self, waiter: Waiter);
}

impl<T> Waitable for Awaitable<T> {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn is_done(&self) -> bool {
        Awaitable::is_done(self)
    }

    fn cancel(&self) {
        self.core.cancel()
    }

    fn completion_seq(&self) -> Option<u64> {
        self.core.seq.get()
    }

    fn register_waiter(&self, waiter: Waiter) {
        self.core.set_awaiter(waiter)
    }

    fn unregister_waiter(&self, waiter: Waiter) {
        self.core.clear_awaiter(waiter)
    }
}

/// Builder of coroutine-driven awaitables.
#[derive(Clone, Debug)]
pub struct Builder {
    name: String,
    stack_size: usize,
}

impl Builder {
    /// Creates a builder using [`Coroutine::DEFAULT_STACK_SIZE`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: Coroutine::DEFAULT_STACK_SIZE,
        }
    }

    /// Sets the stack size of the coroutine.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Starts the coroutine, see [`start_async`].
    pub fn start<T, F>(self, body: F) -> Result<Awaitable<T>>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        let stack = DefaultStack::new(self.stack_size).map_err(Error::Stack)?;
        Ok(spawn(self.name, stack, body))
    }
}

/// Starts a coroutine running `body` and returns the awaitable of its
/// result.
///
/// The body runs immediately until its first suspension. If it returns
/// without suspending, the returned awaitable is already completed.
pub fn start_async<T, F>(name: impl Into<String>, body: F) -> Awaitable<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    spawn(name.into(), DefaultStack::default(), body)
}

fn spawn<T, F>(name: String, stack: DefaultStack, body: F) -> Awaitable<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    let core = Rc::new(Core::new(name.clone()));
    let weak = Rc::downgrade(&core);

    let coroutine = Coroutine::with_stack(name, stack, move || {
        let result = body();

        if let Some(core) = weak.upgrade() {
            core.finish(result);
        }
    });

    core.coroutine.replace(Some(coroutine));

    Awaitable { core }
}
