#![cfg(feature = "std")]

//! Races a countdown running on a thread against the user hitting
//! [Return] on another one. The loser gets interrupted: the countdown
//! thread is woken up and joined, the key thread, stuck in a blocking
//! read, is detached.

use std::{
    io::stdin,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use co_await::{
    await_any, current,
    runtimes::std::{Looper, LooperHandle},
    start_async, suspend, Awaitable, Error,
};
use parking_lot::{Condvar, Mutex};

fn main() {
    env_logger::init();

    let looper = Looper::new();
    let handle = looper.handle();

    // the key thread may outlive the race, keep the loop alive until
    // explicitly stopped
    let _work = handle.work();

    let _launch = async_launch(handle);

    looper.run();
}

fn async_countdown() -> Awaitable {
    start_async("countdown", || {
        let interrupted = Arc::new((Mutex::new(false), Condvar::new()));

        let liftoff = Awaitable::new("evt-liftoff");
        let completer = liftoff.take_completer();

        let countdown = thread::spawn({
            let interrupted = interrupted.clone();
            move || {
                let (lock, cond) = &*interrupted;
                let mut is_interrupted = lock.lock();

                for i in (1..=3).rev() {
                    if *is_interrupted {
                        break;
                    }

                    println!("{i} seconds until liftoff...");

                    // up to 1 second of interruptible sleep
                    let deadline = Instant::now() + Duration::from_secs(1);
                    while !*is_interrupted {
                        if cond.wait_until(&mut is_interrupted, deadline).timed_out() {
                            break;
                        }
                    }
                }

                if *is_interrupted {
                    println!("liftoff aborted!");
                } else {
                    println!("liftoff!");
                    // the abort may come too late: the completer does
                    // nothing if the awaitable is gone by then
                    completer.complete(());
                }
            }
        });

        if let Err(Error::ForcedUnwind) = liftoff.wait() {
            println!("aborting liftoff...");
            let (lock, cond) = &*interrupted;
            *lock.lock() = true;
            cond.notify_one();
        }

        countdown.join().unwrap();
        println!("joined countdown thread");

        Ok(())
    })
}

fn async_key(handle: LooperHandle) -> Awaitable {
    start_async("key", move || {
        let coro = current().unwrap();

        let key = thread::spawn(move || {
            let mut line = String::new();
            stdin().read_line(&mut line).unwrap();

            // resuming a coroutine that is gone does nothing
            handle.post(move || {
                coro.resume();
            });
        });

        match suspend() {
            Ok(()) => {
                key.join().unwrap();
                println!("joined key thread");
                Ok(())
            }
            Err(err) => {
                // uninterruptible blocking read, let the thread go
                drop(key);
                println!("killed key thread");
                Err(err)
            }
        }
    })
}

fn async_launch(handle: LooperHandle) -> Awaitable {
    start_async("launch", move || {
        println!("hit [Return] to abort launch");
        println!();

        let countdown = async_countdown();
        let key = async_key(handle.clone());

        // the loser gets interrupted before this returns
        await_any(&[&countdown, &key])?;

        handle.stop();
        Ok(())
    })
}
