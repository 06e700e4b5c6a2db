#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
//! Stackful coroutines for single-threaded event loops.
//!
//! This crate lets sequential-looking code suspend at any point of
//! its call stack and resume later, while remaining safely
//! cancellable:
//!
//! - [`coro`] contains the coroutine contexts themselves,
//! - [`Awaitable`] represents an operation completing later, driven by
//!   its own coroutine ([`start_async`]) or by a [`Completer`],
//! - [`Completer`] completes an awaitable from any thread, safely
//!   doing nothing once the awaitable is gone,
//! - [`await_any`] and [`await_all`] suspend on several awaitables,
//! - [`runtimes`] contains the loops the core posts its callbacks on.
//!
//! Dropping a pending awaitable cancels it: its coroutine gets
//! [`Error::ForcedUnwind`] at its suspension point, runs its cleanup
//! and returns before the drop completes.
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use co_await::{await_any, runtimes::std::Looper, start_async};
//!
//! let looper = Looper::new();
//! let handle = looper.handle();
//!
//! let main = start_async("main", move || {
//!     let op = some_operation();
//!     let timeout = handle.delay(Duration::from_secs(1));
//!     await_any(&[&op, &timeout])
//! });
//!
//! looper.run();
//! ```

pub mod awaitable;
pub mod combinators;
pub mod completer;
pub mod coro;
mod error;
pub mod runtime;
pub mod runtimes;

#[doc(inline)]
pub use crate::{
    awaitable::{start_async, AwaitState, Awaitable, Builder, Waitable},
    combinators::{await_all, await_any},
    completer::Completer,
    coro::{current, suspend, CoroHandle, CoroState, Coroutine},
    error::{Error, Result},
};
