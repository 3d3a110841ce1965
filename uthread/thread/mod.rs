// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements green threads of execution.
//!
//! A thread is created with [`create`], which gives it its own stack and
//! queues it to run the next time the scheduler passes over it. The
//! thread's entry point returns an exit code, which can be collected by
//! one other thread calling [`join`]. A thread can also finish early by
//! calling [`exit`].
//!
//! Threads that have exited become zombies. A zombie keeps its exit code
//! and its stack until any pending [`join`] has collected the code, after
//! which the scheduler frees it the next time it passes over it.

use crate::scheduler::JoinStatus;
use crate::switch::{init_context, Context};
use crate::thread::stacks::{allocate_stack, free_stack, Stack};
use crate::{with_scheduler, Error, PANIC_EXIT_CODE};
use log::error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

pub mod stacks;

/// The code run by a created thread. Its return value
/// becomes the thread's exit code.
///
pub(crate) type Entry = Box<dyn FnOnce() -> i32>;

/// Creates a new thread that will run `entry`, queueing
/// it at the rear of the ready queue.
///
/// When `entry` returns, the thread exits with the
/// returned value as its exit code. If `entry` panics,
/// the panic is caught and the thread exits with
/// [`PANIC_EXIT_CODE`].
///
/// # Panics
///
/// `create` will panic if no scheduler has been started
/// on this host thread.
///
pub fn create<F>(entry: F) -> Result<ThreadId, Error>
where
    F: FnOnce() -> i32 + 'static,
{
    with_scheduler(|scheduler| scheduler.create(Box::new(entry)))
}

/// Returns the id of the currently executing thread.
///
/// # Panics
///
/// `current_thread_id` will panic if no scheduler has
/// been started on this host thread.
///
pub fn current_thread_id() -> ThreadId {
    with_scheduler(|scheduler| scheduler.current())
}

/// Returns the state of the given thread, or `None`
/// if it never existed or has been freed.
///
/// # Panics
///
/// `thread_state` will panic if no scheduler has been
/// started on this host thread.
///
pub fn thread_state(id: ThreadId) -> Option<ThreadState> {
    with_scheduler(|scheduler| scheduler.state(id))
}

/// Terminates the current thread with the given exit
/// code and switches to the next eligible thread.
///
/// # Panics
///
/// `exit` will panic if called by the initial thread,
/// which must keep running so it can call [`stop`](crate::stop),
/// or if no other thread is able to run.
///
pub fn exit(code: i32) -> ! {
    let switch = with_scheduler(|scheduler| scheduler.exit_current(code));

    // We never return from a switch away from
    // a zombie.
    unsafe { switch.perform() };
    unreachable!("exited thread was rescheduled somehow");
}

/// Waits for the given thread to exit, returning its
/// exit code.
///
/// If the thread has already exited, but has not yet
/// been freed, its exit code is returned immediately.
/// Otherwise, the calling thread is not scheduled
/// again until the target has exited.
///
/// `join` fails with [`Error::InvalidOperation`] if the
/// target is the caller or the initial thread, if
/// another thread is already waiting to join it, or if
/// the caller was woken before the target exited. It
/// fails with [`Error::NotFound`] if the target does
/// not exist or has already been freed.
///
/// # Panics
///
/// `join` will panic if no scheduler has been started
/// on this host thread.
///
pub fn join(target: ThreadId) -> Result<i32, Error> {
    match with_scheduler(|scheduler| scheduler.begin_join(target))? {
        JoinStatus::Exited(code) => Ok(code),
        JoinStatus::Pending => {
            crate::scheduler::yield_now();
            with_scheduler(|scheduler| scheduler.finish_join(target))
        }
    }
}

/// The first Rust code executed by a created thread.
///
/// This is where the trampoline built by [`init_context`]
/// lands the first time the thread is switched to.
///
extern "sysv64" fn thread_entry() -> ! {
    let entry = with_scheduler(|scheduler| scheduler.take_entry());
    let code = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(code) => code,
        Err(_) => {
            error!("thread {} panicked", current_thread_id());
            PANIC_EXIT_CODE
        }
    };

    exit(code);
}

/// Uniquely identifies a thread.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u16);

impl ThreadId {
    /// MAIN is the unique thread id for the initial
    /// thread, which called [`start`](crate::start).
    ///
    pub const MAIN: Self = ThreadId(0);

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues thread ids for a single scheduler.
///
/// Ids are issued in increasing order and are never
/// reused. The largest id is reserved, so allocation
/// fails once every other id has been issued.
///
#[derive(Debug)]
pub(crate) struct ThreadIds {
    next: u16,
}

impl ThreadIds {
    /// Returns a counter whose first id follows
    /// [`ThreadId::MAIN`].
    ///
    pub const fn new() -> Self {
        ThreadIds { next: 1 }
    }

    #[cfg(test)]
    pub const fn starting_at(next: u16) -> Self {
        ThreadIds { next }
    }

    /// Allocates and returns the next available
    /// ThreadId.
    ///
    pub fn allocate(&mut self) -> Option<ThreadId> {
        if self.next == u16::MAX {
            return None;
        }

        let id = ThreadId(self.next);
        self.next += 1;

        Some(id)
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread has been created, but has
    /// not yet run.
    Ready,

    /// The thread is executing.
    Running,

    /// The thread has run before and is waiting
    /// in the ready queue. It may be waiting to
    /// join another thread.
    Blocked,

    /// The thread has exited. Its exit code can
    /// still be collected.
    Zombie,
}

/// Contains the metadata for a thread of
/// execution.
///
pub(crate) struct Thread {
    id: ThreadId,
    pub state: ThreadState,

    // The thread's saved stack pointer. While the
    // thread is executing, this value is stale.
    pub context: Context,

    // The thread's stack. The initial thread
    // runs on the host thread's stack, so has
    // no stack of its own.
    stack: Option<Stack>,

    // The thread's entry point, taken when
    // the thread first runs.
    entry: Option<Entry>,

    // Set when the thread exits.
    pub exit_code: i32,

    // The thread waiting to join this one,
    // if any.
    pub joiner: Option<ThreadId>,
}

impl Thread {
    /// Returns the thread control block for a scheduler's
    /// initial thread, which is already running.
    ///
    pub fn new_initial() -> Box<Thread> {
        Box::new(Thread {
            id: ThreadId::MAIN,
            state: ThreadState::Running,
            context: Context::default(),
            stack: None,
            entry: None,
            exit_code: 0,
            joiner: None,
        })
    }

    /// Allocates a stack for a new thread and prepares
    /// it to run `entry` when first switched to.
    ///
    pub fn new(id: ThreadId, stack_size: usize, entry: Entry) -> Result<Box<Thread>, Error> {
        let mut stack = allocate_stack(stack_size)?;
        let mut context = Context::default();
        init_context(&mut context, &mut stack, thread_entry);

        Ok(Box::new(Thread {
            id,
            state: ThreadState::Ready,
            context,
            stack: Some(stack),
            entry: Some(entry),
            exit_code: 0,
            joiner: None,
        }))
    }

    /// Returns the thread's unique ThreadId.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Takes the thread's entry point. This returns
    /// `None` for the initial thread, or if the entry
    /// point has already been taken.
    ///
    pub fn take_entry(&mut self) -> Option<Entry> {
        self.entry.take()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            free_stack(stack);
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("stack", &self.stack.as_ref().map(Stack::size))
            .field("started", &self.entry.is_none())
            .field("exit_code", &self.exit_code)
            .field("joiner", &self.joiner)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MIN_STACK_SIZE;

    #[test]
    fn test_thread_ids() {
        let mut ids = ThreadIds::new();
        assert_eq!(ids.allocate(), Some(ThreadId(1)));
        assert_eq!(ids.allocate(), Some(ThreadId(2)));
        assert_eq!(ids.allocate(), Some(ThreadId(3)));
    }

    #[test]
    fn test_thread_ids_exhausted() {
        let mut ids = ThreadIds::starting_at(u16::MAX - 2);
        assert_eq!(ids.allocate(), Some(ThreadId(u16::MAX - 2)));
        assert_eq!(ids.allocate(), Some(ThreadId(u16::MAX - 1)));

        // The largest id is never issued.
        assert_eq!(ids.allocate(), None);
        assert_eq!(ids.allocate(), None);
    }

    #[test]
    fn test_thread_id_display() {
        assert_eq!(ThreadId::MAIN.to_string(), "0");
        assert_eq!(ThreadId(513).to_string(), "513");
        assert_eq!(ThreadId(513).as_u16(), 513);
    }

    #[test]
    fn test_new_thread() {
        let mut thread = Thread::new(ThreadId(7), MIN_STACK_SIZE, Box::new(|| 3)).unwrap();
        assert_eq!(thread.id(), ThreadId(7));
        assert_eq!(thread.state, ThreadState::Ready);
        assert_eq!(thread.joiner, None);
        assert!(thread.stack.is_some());

        let entry = thread.take_entry().unwrap();
        assert_eq!(entry(), 3);
        assert!(thread.take_entry().is_none());
    }

    #[test]
    fn test_initial_thread() {
        let mut thread = Thread::new_initial();
        assert_eq!(thread.id(), ThreadId::MAIN);
        assert_eq!(thread.state, ThreadState::Running);
        assert!(thread.stack.is_none());
        assert!(thread.take_entry().is_none());
    }
}
