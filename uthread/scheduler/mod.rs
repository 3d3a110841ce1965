// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for green threads.
//!
//! ## Lifecycle
//!
//! A host thread calls [`start`] to create its scheduler, becoming the
//! initial thread. Once every created thread has exited and been freed,
//! the initial thread calls [`stop`] to destroy the scheduler again.
//!
//! ## Thread switching
//!
//! [`yield_now`] can be called to proactively switch to the next eligible
//! thread. Every thread that is not running waits in a single FIFO queue.
//! When switching, the scheduler dequeues candidates from the front until
//! it finds one that is able to run:
//!
//! - A zombie with nobody waiting to join it is freed.
//! - A zombie that is waiting for its joiner to collect its exit code is
//!   put back at the rear.
//! - A thread that is waiting to join a thread that has not yet exited is
//!   put back at the rear.
//!
//! Each candidate is examined at most once per switch. If none is able to
//! run, the current thread keeps running. Otherwise, the current thread is
//! queued at the rear and the candidate takes over.

use crate::switch::{switch_context, Context};
use crate::thread::{Entry, Thread, ThreadId, ThreadIds, ThreadState};
use crate::{try_with_scheduler, with_scheduler, Config, Error, SCHEDULER};
use log::{debug, trace};
use queue::Queue;
use std::collections::BTreeMap;

type ThreadTable = BTreeMap<ThreadId, Box<Thread>>;

/// Returns the thread with the given id.
///
/// # Panics
///
/// `lookup` will panic if the thread has been freed,
/// as every id held by the scheduler must refer to a
/// living thread.
///
fn lookup(threads: &ThreadTable, id: ThreadId) -> &Thread {
    match threads.get(&id) {
        Some(thread) => thread,
        None => panic!("thread {} used after it was freed", id),
    }
}

/// Describes the outcome of starting to join a thread.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinStatus {
    /// The target had already exited with this code.
    Exited(i32),

    /// The caller has been registered as the target's
    /// joiner and must yield until the target exits.
    Pending,
}

/// A context switch chosen by the scheduler.
///
/// The switch is performed after the scheduler has been
/// released, so the next thread can use it.
///
#[derive(Debug)]
#[must_use]
pub(crate) struct Switch {
    from: *mut Context,
    to: *const Context,
}

impl Switch {
    /// Suspends the current thread and resumes the
    /// chosen thread. This returns when the current
    /// thread is next scheduled.
    ///
    /// # Safety
    ///
    /// The scheduler must not be borrowed, and no
    /// thread may have been freed since the switch was
    /// chosen.
    ///
    pub unsafe fn perform(self) {
        switch_context(self.from, self.to);
    }
}

/// Scheduler is a basic thread scheduler.
///
/// Currently, it implements a round-robin algorithm.
///
#[derive(Debug)]
pub(crate) struct Scheduler {
    // Every thread other than the current thread,
    // in the order they will be considered.
    ready: Queue<ThreadId>,

    // Every thread that has not yet been freed,
    // including the current thread.
    threads: ThreadTable,

    current: ThreadId,
    ids: ThreadIds,
    config: Config,
}

impl Scheduler {
    /// Returns a new scheduler, with the caller as its
    /// running initial thread.
    ///
    pub fn new(config: Config) -> Self {
        Scheduler::with_ids(config, ThreadIds::new())
    }

    fn with_ids(config: Config, ids: ThreadIds) -> Self {
        let mut threads = ThreadTable::new();
        threads.insert(ThreadId::MAIN, Thread::new_initial());

        Scheduler {
            ready: Queue::new(),
            threads,
            current: ThreadId::MAIN,
            ids,
            config,
        }
    }

    /// Returns the id of the running thread.
    ///
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Returns the state of the given thread, if it
    /// has not yet been freed.
    ///
    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(&id).map(|thread| thread.state)
    }

    /// Returns whether any threads other than the
    /// current thread remain.
    ///
    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    fn thread(&self, id: ThreadId) -> &Thread {
        lookup(&self.threads, id)
    }

    fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.threads.get_mut(&id) {
            Some(thread) => thread,
            None => panic!("thread {} used after it was freed", id),
        }
    }

    /// Creates a new thread and queues it at the rear
    /// of the ready queue.
    ///
    pub fn create(&mut self, entry: Entry) -> Result<ThreadId, Error> {
        let id = self.ids.allocate().ok_or(Error::ResourceExhausted)?;
        let thread = Thread::new(id, self.config.stack_size, entry)?;
        self.ready.enqueue(id)?;
        self.threads.insert(id, thread);
        debug!("created thread {}", id);

        Ok(id)
    }

    /// Takes the current thread's entry point, so it
    /// can start running.
    ///
    /// # Panics
    ///
    /// `take_entry` will panic if the current thread
    /// has already started.
    ///
    pub fn take_entry(&mut self) -> Entry {
        let current = self.current;
        match self.thread_mut(current).take_entry() {
            Some(entry) => entry,
            None => panic!("thread {} was started twice", current),
        }
    }

    /// Puts `id` back at the rear of the ready queue.
    ///
    /// This is only called straight after a dequeue,
    /// which leaves a free slot in the queue, so it
    /// cannot fail.
    ///
    fn requeue(&mut self, id: ThreadId) {
        if let Err(err) = self.ready.enqueue(id) {
            unreachable!("failed to requeue thread {}: {}", id, err);
        }
    }

    /// Frees an exited thread, returning its stack to
    /// the pool.
    ///
    fn reclaim(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.remove(&id) {
            debug!("freeing thread {} (exit code {})", thread.id(), thread.exit_code);
        }
    }

    /// Returns whether `id` is waiting to join a thread
    /// that has not yet exited.
    ///
    fn awaits_live_thread(&mut self, id: ThreadId) -> bool {
        let waits_on =
            |thread: &Thread| thread.joiner == Some(id) && thread.state != ThreadState::Zombie;

        let threads = &self.threads;
        let queued = self
            .ready
            .iterate(|_, other| waits_on(lookup(threads, *other)))
            .is_some();

        queued || waits_on(self.thread(self.current))
    }

    /// Dequeues candidates until one is found that is
    /// able to run, returning its id.
    ///
    /// Each thread in the queue when `select_next` is
    /// called is examined at most once.
    ///
    fn select_next(&mut self) -> Option<ThreadId> {
        for _ in 0..self.ready.len() {
            let id = self.ready.dequeue().ok()?;
            let thread = self.thread(id);
            let (state, joiner) = (thread.state, thread.joiner);
            if state == ThreadState::Zombie {
                match joiner {
                    None => self.reclaim(id),
                    Some(joiner) => {
                        trace!("thread {} is waiting for thread {} to join it", id, joiner);
                        self.requeue(id);
                    }
                }

                continue;
            }

            if self.awaits_live_thread(id) {
                trace!("skipping thread {}, which is waiting to join", id);
                self.requeue(id);
                continue;
            }

            return Some(id);
        }

        None
    }

    /// Chooses the next thread to run, returning the
    /// switch to it.
    ///
    /// If another thread is able to run, the current
    /// thread is queued at the rear, the chosen thread
    /// becomes current, and the returned switch must be
    /// performed. Otherwise, the current thread keeps
    /// running and `dispatch` returns `None`.
    ///
    pub fn dispatch(&mut self) -> Option<Switch> {
        let previous = self.current;
        let next = match self.select_next() {
            Some(next) => next,
            None => {
                trace!("no thread can replace thread {}", previous);
                let current = self.thread_mut(previous);
                if current.state == ThreadState::Blocked {
                    current.state = ThreadState::Running;
                }

                return None;
            }
        };

        self.requeue(previous);
        let current = self.thread_mut(previous);
        if current.state != ThreadState::Zombie {
            current.state = ThreadState::Blocked;
        }

        let from: *mut Context = &mut current.context;

        let thread = self.thread_mut(next);
        thread.state = ThreadState::Running;
        let to: *const Context = &thread.context;

        self.current = next;
        trace!("switching from thread {} to thread {}", previous, next);

        Some(Switch { from, to })
    }

    /// Marks the current thread as exited and chooses
    /// the next thread to run.
    ///
    /// # Panics
    ///
    /// `exit_current` will panic if the current thread
    /// is the initial thread, or if no other thread is
    /// able to run.
    ///
    pub fn exit_current(&mut self, code: i32) -> Switch {
        let id = self.current;
        if id == ThreadId::MAIN {
            panic!("initial thread tried to exit");
        }

        let current = self.thread_mut(id);
        current.exit_code = code;
        current.state = ThreadState::Zombie;
        debug!("thread {} exited with code {}", id, code);

        match self.dispatch() {
            Some(switch) => switch,
            None => panic!("thread {} exited, but no other thread can run", id),
        }
    }

    /// Starts joining `target`.
    ///
    /// If the target has already exited, its exit code
    /// is collected straight away. Otherwise, the current
    /// thread is recorded as its joiner and must yield,
    /// then call [`finish_join`](Self::finish_join).
    ///
    pub fn begin_join(&mut self, target: ThreadId) -> Result<JoinStatus, Error> {
        let caller = self.current;
        if target == caller || target == ThreadId::MAIN {
            return Err(Error::InvalidOperation);
        }

        // Look for a thread that is still running, or
        // one that has exited but is yet to be collected.
        let threads = &self.threads;
        self.ready
            .iterate(|_, id| {
                let thread = lookup(threads, *id);
                *id == target
                    && match thread.state {
                        ThreadState::Zombie => thread.joiner.is_none(),
                        _ => true,
                    }
            })
            .ok_or(Error::NotFound)?;

        let thread = self.thread_mut(target);
        if thread.joiner.is_some() && thread.joiner != Some(caller) {
            return Err(Error::InvalidOperation);
        }

        if thread.state == ThreadState::Zombie {
            thread.joiner = None;
            debug!("thread {} joined thread {}", caller, target);
            return Ok(JoinStatus::Exited(thread.exit_code));
        }

        thread.joiner = Some(caller);
        self.thread_mut(caller).state = ThreadState::Blocked;
        debug!("thread {} waiting to join thread {}", caller, target);

        Ok(JoinStatus::Pending)
    }

    /// Completes a pending join, once the joiner has been
    /// scheduled again.
    ///
    /// This fails if the target has not yet exited,
    /// which happens if no other thread was able to run.
    ///
    pub fn finish_join(&mut self, target: ThreadId) -> Result<i32, Error> {
        let caller = self.current;
        let thread = self.thread_mut(target);
        thread.joiner = None;
        if thread.state != ThreadState::Zombie {
            debug!("thread {} woke before thread {} exited", caller, target);
            return Err(Error::InvalidOperation);
        }

        debug!("thread {} joined thread {}", caller, target);

        Ok(thread.exit_code)
    }

    /// Destroys the scheduler, once every other thread
    /// has been freed.
    ///
    fn shutdown(self) {
        if let Err(err) = self.ready.destroy() {
            // stop only shuts down once the queue
            // has drained.
            unreachable!("{}", err);
        }

        debug!("scheduler stopped after {} threads", self.threads.len());
    }
}

/// Starts a scheduler on the calling host thread, with
/// the default configuration. The caller becomes the
/// initial thread.
///
/// `start` fails with [`Error::InvalidOperation`] if
/// `preempt` is set, as preemption is not supported,
/// or if a scheduler is already running on this host
/// thread.
///
pub fn start(preempt: bool) -> Result<(), Error> {
    start_with(Config {
        preempt,
        ..Config::default()
    })
}

/// Starts a scheduler on the calling host thread, with
/// the given configuration.
///
pub fn start_with(config: Config) -> Result<(), Error> {
    config.validate()?;
    SCHEDULER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::InvalidOperation);
        }

        *slot = Some(Scheduler::new(config));
        debug!("scheduler started with {:?}", config);

        Ok(())
    })
}

/// Waits for every other thread to exit and be freed,
/// then destroys the scheduler. [`start`] may be called
/// again afterwards.
///
/// `stop` fails with [`Error::InvalidOperation`] if it
/// is not called by the initial thread of a running
/// scheduler.
///
/// # Panics
///
/// `stop` will panic if the remaining threads are all
/// waiting to join one another, so can never exit.
///
pub fn stop() -> Result<(), Error> {
    if try_with_scheduler(|scheduler| scheduler.current()) != Some(ThreadId::MAIN) {
        return Err(Error::InvalidOperation);
    }

    loop {
        let switch = with_scheduler(|scheduler| {
            let switch = scheduler.dispatch();
            if switch.is_none() && !scheduler.ready_is_empty() {
                panic!("cannot stop scheduler: the remaining threads are deadlocked");
            }

            switch
        });

        match switch {
            Some(switch) => unsafe { switch.perform() },
            None => break,
        }
    }

    let scheduler = SCHEDULER.with(|slot| slot.borrow_mut().take());
    if let Some(scheduler) = scheduler {
        scheduler.shutdown();
    }

    Ok(())
}

/// Schedules out the current thread and switches to the
/// next eligible thread.
///
/// If no other thread is able to run, `yield_now` returns
/// immediately.
///
/// # Panics
///
/// `yield_now` will panic if no scheduler has been
/// started on this host thread.
///
pub fn yield_now() {
    if let Some(switch) = with_scheduler(Scheduler::dispatch) {
        unsafe { switch.perform() };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MIN_STACK_SIZE;

    // These tests drive the scheduler's decisions
    // directly, without ever performing a switch.

    fn scheduler() -> Scheduler {
        Scheduler::new(Config {
            stack_size: MIN_STACK_SIZE,
            preempt: false,
        })
    }

    fn queued(scheduler: &Scheduler) -> Vec<ThreadId> {
        scheduler.ready.iter().copied().collect()
    }

    #[test]
    fn test_new_scheduler() {
        let scheduler = scheduler();
        assert_eq!(scheduler.current(), ThreadId::MAIN);
        assert_eq!(scheduler.state(ThreadId::MAIN), Some(ThreadState::Running));
        assert!(scheduler.ready_is_empty());
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let mut scheduler = scheduler();
        let first = scheduler.create(Box::new(|| 0)).unwrap();
        let second = scheduler.create(Box::new(|| 0)).unwrap();
        assert_eq!(first.as_u16(), 1);
        assert_eq!(second.as_u16(), 2);
        assert_eq!(queued(&scheduler), vec![first, second]);
        assert_eq!(scheduler.state(first), Some(ThreadState::Ready));
    }

    #[test]
    fn test_create_exhausts_ids() {
        let config = Config {
            stack_size: MIN_STACK_SIZE,
            preempt: false,
        };
        let mut scheduler = Scheduler::with_ids(config, ThreadIds::starting_at(u16::MAX - 1));
        let last = scheduler.create(Box::new(|| 0)).unwrap();
        assert_eq!(last.as_u16(), u16::MAX - 1);
        assert_eq!(scheduler.create(Box::new(|| 0)), Err(Error::ResourceExhausted));
        assert_eq!(queued(&scheduler), vec![last]);
    }

    #[test]
    fn test_dispatch_empty() {
        let mut scheduler = scheduler();
        assert!(scheduler.dispatch().is_none());
        assert_eq!(scheduler.current(), ThreadId::MAIN);
        assert_eq!(scheduler.state(ThreadId::MAIN), Some(ThreadState::Running));
    }

    #[test]
    fn test_dispatch_round_robin() {
        let mut scheduler = scheduler();
        let first = scheduler.create(Box::new(|| 0)).unwrap();
        let second = scheduler.create(Box::new(|| 0)).unwrap();

        assert!(scheduler.dispatch().is_some());
        assert_eq!(scheduler.current(), first);
        assert_eq!(scheduler.state(first), Some(ThreadState::Running));
        assert_eq!(scheduler.state(ThreadId::MAIN), Some(ThreadState::Blocked));
        assert_eq!(queued(&scheduler), vec![second, ThreadId::MAIN]);

        assert!(scheduler.dispatch().is_some());
        assert_eq!(scheduler.current(), second);
        assert_eq!(queued(&scheduler), vec![ThreadId::MAIN, first]);
    }

    #[test]
    fn test_dispatch_reclaims_unjoined_zombies() {
        let mut scheduler = scheduler();
        let first = scheduler.create(Box::new(|| 0)).unwrap();
        let second = scheduler.create(Box::new(|| 0)).unwrap();
        scheduler.thread_mut(first).state = ThreadState::Zombie;

        assert!(scheduler.dispatch().is_some());
        assert_eq!(scheduler.current(), second);
        assert_eq!(scheduler.state(first), None);
        assert_eq!(queued(&scheduler), vec![ThreadId::MAIN]);
    }

    #[test]
    fn test_dispatch_keeps_joined_zombies() {
        let mut scheduler = scheduler();
        let zombie = scheduler.create(Box::new(|| 0)).unwrap();
        let joiner = scheduler.create(Box::new(|| 0)).unwrap();
        let target = scheduler.thread_mut(zombie);
        target.state = ThreadState::Zombie;
        target.joiner = Some(joiner);

        // The joiner is free to run, as its target
        // has exited.
        assert!(scheduler.dispatch().is_some());
        assert_eq!(scheduler.current(), joiner);
        assert_eq!(scheduler.state(zombie), Some(ThreadState::Zombie));
        assert_eq!(queued(&scheduler), vec![zombie, ThreadId::MAIN]);
    }

    #[test]
    fn test_dispatch_skips_threads_joining_live_threads() {
        let mut scheduler = scheduler();
        let joiner = scheduler.create(Box::new(|| 0)).unwrap();
        let target = scheduler.create(Box::new(|| 0)).unwrap();
        scheduler.thread_mut(target).joiner = Some(joiner);

        // The joiner is at the front, but must wait
        // for its target.

        assert!(scheduler.dispatch().is_some());
        assert_eq!(scheduler.current(), target);
        assert_eq!(queued(&scheduler), vec![joiner, ThreadId::MAIN]);
    }

    #[test]
    fn test_dispatch_skips_joiner_of_current() {
        let mut scheduler = scheduler();
        let joiner = scheduler.create(Box::new(|| 0)).unwrap();

        // The initial thread is being joined, so
        // its joiner has nothing to do.
        scheduler.thread_mut(ThreadId::MAIN).joiner = Some(joiner);
        assert!(scheduler.dispatch().is_none());
        assert_eq!(scheduler.current(), ThreadId::MAIN);
        assert_eq!(queued(&scheduler), vec![joiner]);
    }

    #[test]
    fn test_dispatch_restores_blocked_caller() {
        let mut scheduler = scheduler();
        let joiner = scheduler.create(Box::new(|| 0)).unwrap();
        scheduler.thread_mut(ThreadId::MAIN).joiner = Some(joiner);
        scheduler.thread_mut(ThreadId::MAIN).state = ThreadState::Blocked;

        assert!(scheduler.dispatch().is_none());
        assert_eq!(scheduler.state(ThreadId::MAIN), Some(ThreadState::Running));
    }

    #[test]
    fn test_begin_join_rejects_self_and_main() {
        let mut scheduler = scheduler();
        assert_eq!(
            scheduler.begin_join(ThreadId::MAIN),
            Err(Error::InvalidOperation)
        );
    }

    #[test]
    fn test_begin_join_unknown_thread() {
        let mut scheduler = scheduler();
        let thread = scheduler.create(Box::new(|| 0)).unwrap();
        scheduler.thread_mut(thread).state = ThreadState::Zombie;

        // The zombie is freed the next time the
        // scheduler passes over it.
        assert!(scheduler.dispatch().is_none());
        assert_eq!(scheduler.begin_join(thread), Err(Error::NotFound));
    }

    #[test]
    fn test_begin_join_pending_then_exited() {
        let mut scheduler = scheduler();
        let target = scheduler.create(Box::new(|| 0)).unwrap();

        assert_eq!(scheduler.begin_join(target), Ok(JoinStatus::Pending));
        assert_eq!(scheduler.thread(target).joiner, Some(ThreadId::MAIN));
        assert_eq!(scheduler.state(ThreadId::MAIN), Some(ThreadState::Blocked));

        // Waking early fails and clears the
        // registration.
        assert_eq!(scheduler.finish_join(target), Err(Error::InvalidOperation));
        assert_eq!(scheduler.thread(target).joiner, None);

        // Once the target has exited, the code is
        // collected straight away.
        let thread = scheduler.thread_mut(target);
        thread.state = ThreadState::Zombie;
        thread.exit_code = 9;
        assert_eq!(scheduler.begin_join(target), Ok(JoinStatus::Exited(9)));
        assert_eq!(scheduler.thread(target).joiner, None);
    }

    #[test]
    fn test_begin_join_rejects_second_joiner() {
        let mut scheduler = scheduler();
        let target = scheduler.create(Box::new(|| 0)).unwrap();
        let other = scheduler.create(Box::new(|| 0)).unwrap();
        scheduler.thread_mut(target).joiner = Some(other);

        assert_eq!(scheduler.begin_join(target), Err(Error::InvalidOperation));
        assert_eq!(scheduler.thread(target).joiner, Some(other));
    }

    #[test]
    #[should_panic(expected = "initial thread tried to exit")]
    fn test_exit_initial_thread() {
        let mut scheduler = scheduler();
        let _ = scheduler.exit_current(0);
    }

    #[test]
    fn test_shutdown() {
        let scheduler = scheduler();
        scheduler.shutdown();
    }
}
