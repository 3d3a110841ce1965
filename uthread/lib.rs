// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements cooperative multitasking, using user-level threads of execution.
//!
//! A host thread calls [`start`] to become the initial thread (with id
//! [`ThreadId::MAIN`]) of a scheduler. It can then [`create`] any number of
//! green threads, each with its own stack. All of them share the host
//! thread, and control only moves between them when the running thread
//! calls [`yield_now`], [`exit`], or [`join`]. There is no preemption.
//!
//! ## Shared state
//!
//! The scheduler is stored in a slot local to the host thread, so that
//! every function in the crate can reach it. It is created by [`start`]
//! and destroyed by [`stop`], which waits for every green thread to
//! finish. Green threads never migrate between host threads, so host
//! threads with their own schedulers do not interfere. The only state
//! shared between host threads is the pool of released thread stacks.
//!
//! ## Scheduling
//!
//! Threads that are not running wait in a single FIFO queue. Each switch
//! puts the outgoing thread at the rear and picks the first eligible
//! thread from the front, which gives round-robin scheduling. Exited
//! threads stay in the queue until their exit code has been collected
//! by [`join`] (if anyone asked for it), then are freed the next time the
//! scheduler passes over them.
//!
//! # Examples
//!
//! ```
//! uthread::start(false).unwrap();
//!
//! let worker = uthread::create(|| {
//!     uthread::yield_now();
//!     42
//! })
//! .unwrap();
//!
//! assert_eq!(uthread::join(worker), Ok(42));
//! uthread::stop().unwrap();
//! ```

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

#[cfg(not(all(target_arch = "x86_64", unix, not(target_vendor = "apple"))))]
compile_error!("uthread only supports x86-64 targets using the System V ABI and ELF");

pub mod scheduler;
mod switch;
pub mod thread;

pub use crate::scheduler::{start, start_with, stop, yield_now};
pub use crate::thread::{
    create, current_thread_id, exit, join, thread_state, ThreadId, ThreadState,
};

use crate::scheduler::Scheduler;
use std::cell::RefCell;
use std::fmt;

/// The stack size given to new threads unless
/// configured otherwise.
///
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024; // 256 KiB.

/// The smallest stack size accepted by [`start_with`].
///
pub const MIN_STACK_SIZE: usize = 16 * 1024; // 16 KiB.

/// The exit code of a thread whose entry point
/// panicked.
///
pub const PANIC_EXIT_CODE: i32 = -1;

/// Describes a failed threading operation.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The configuration passed to [`start_with`]
    /// was rejected.
    InvalidArgument,

    /// No thread with the given id is waiting
    /// to run.
    NotFound,

    /// Memory for a thread or its stack could not
    /// be allocated, or thread ids have run out.
    ResourceExhausted,

    /// The operation is not allowed for this thread
    /// or in the scheduler's current state.
    InvalidOperation,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "thread not found"),
            Error::ResourceExhausted => write!(f, "resources exhausted"),
            Error::InvalidOperation => write!(f, "invalid operation"),
        }
    }
}

impl std::error::Error for Error {}

impl From<queue::Error> for Error {
    fn from(err: queue::Error) -> Self {
        match err {
            queue::Error::Empty | queue::Error::NotFound => Error::NotFound,
            queue::Error::ResourceExhausted => Error::ResourceExhausted,
        }
    }
}

/// Configures a scheduler, as passed to [`start_with`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The number of bytes in each new thread's stack.
    /// This is rounded up to a whole number of pages,
    /// and an inaccessible guard page is added below.
    pub stack_size: usize,

    /// Requests timer-based preemption, which is not
    /// supported. Starting a scheduler with this set
    /// fails.
    pub preempt: bool,
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.preempt {
            return Err(Error::InvalidOperation);
        }

        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            preempt: false,
        }
    }
}

// State shared throughout the crate.

thread_local! {
    /// SCHEDULER is the thread scheduler for this host
    /// thread, if one has been started.
    ///
    static SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
}

/// Calls `f` with the scheduler, if one is running on
/// this host thread.
///
/// The scheduler must not be borrowed across a context
/// switch, so `f` must not switch threads.
///
fn try_with_scheduler<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Scheduler) -> R,
{
    SCHEDULER.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// Calls `f` with the scheduler.
///
/// # Panics
///
/// `with_scheduler` panics if no scheduler has been
/// started on this host thread.
///
fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    match try_with_scheduler(f) {
        Some(result) => result,
        None => panic!("uthread used without a running scheduler; call uthread::start first"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert_eq!(Config::default().validate(), Ok(()));

        let preempt = Config {
            preempt: true,
            ..Config::default()
        };
        assert_eq!(preempt.validate(), Err(Error::InvalidOperation));

        let tiny = Config {
            stack_size: MIN_STACK_SIZE - 1,
            ..Config::default()
        };
        assert_eq!(tiny.validate(), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_queue_error_conversion() {
        assert_eq!(Error::from(queue::Error::Empty), Error::NotFound);
        assert_eq!(Error::from(queue::Error::NotFound), Error::NotFound);
        assert_eq!(
            Error::from(queue::Error::ResourceExhausted),
            Error::ResourceExhausted
        );
    }
}
