//! Combinators suspending on several awaitables at once.
//!
//! Both combinators take type-erased [`Waitable`]s, so awaitables of
//! different result types can be mixed:
//!
//! ```ignore
//! let idx = await_any(&[&countdown, &key])?;
//! ```

use log::{debug, trace};

use crate::{awaitable::Waitable, runtime, Result};

/// Suspends the calling coroutine until one of the given awaitables
/// completes, and returns its index.
///
/// All other pending awaitables are cancelled, in list order, before
/// this function returns. When several awaitables completed before the
/// caller got resumed, the one that completed first wins.
///
/// If the caller is torn down while waiting, every pending awaitable
/// is cancelled and [`crate::Error::ForcedUnwind`] is returned.
///
/// Panics on an empty list, or when it has to suspend outside of a
/// coroutine.
pub fn await_any(awts: &[&dyn Waitable]) -> Result<usize> {
    if awts.is_empty() {
        panic!("cannot await any of an empty list of awaitables");
    }

    loop {
        if let Some(idx) = first_completed(awts) {
            debug!("awaitable {} completed first", awts[idx].name());

            for (i, awt) in awts.iter().enumerate() {
                if i != idx {
                    awt.cancel();
                }
            }

            return Ok(idx);
        }

        if let Err(err) = park("await any", awts) {
            cancel_all(awts);
            return Err(err);
        }
    }
}

/// Suspends the calling coroutine until all the given awaitables
/// complete.
///
/// If the caller is torn down while waiting, every pending awaitable
/// is cancelled and [`crate::Error::ForcedUnwind`] is returned.
pub fn await_all(awts: &[&dyn Waitable]) -> Result<()> {
    while awts.iter().any(|awt| !awt.is_done()) {
        if let Err(err) = park("await all", awts) {
            cancel_all(awts);
            return Err(err);
        }
    }

    Ok(())
}

fn first_completed(awts: &[&dyn Waitable]) -> Option<usize> {
    awts.iter()
        .enumerate()
        .filter_map(|(idx, awt)| awt.completion_seq().map(|seq| (seq, idx)))
        .min()
        .map(|(_, idx)| idx)
}

/// Registers the current coroutine as waiter of every pending
/// awaitable, then suspends it.
fn park(op: &str, awts: &[&dyn Waitable]) -> Result<()> {
    let Some(ctx) = runtime::current() else {
        panic!("cannot {op} outside of a coroutine");
    };

    let waiter = ctx.waiter();

    for awt in awts.iter().filter(|awt| !awt.is_done()) {
        awt.register_waiter(waiter);
    }

    trace!("{op} of {} awaitables", awts.len());
    let resumed = ctx.suspend();

    for awt in awts {
        awt.unregister_waiter(waiter);
    }

    resumed
}

fn cancel_all(awts: &[&dyn Waitable]) {
    for awt in awts {
        awt.cancel();
    }
}
