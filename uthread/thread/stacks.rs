// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers and state for managing the stacks used by green
//! threads.
//!
//! Each created thread has its own stack, mapped by calling
//! [`allocate_stack`] and released by calling [`free_stack`]. The
//! initial thread has no separate stack: it keeps running on the host
//! thread's stack. Released stacks are kept in a small pool and returned by
//! later calls to [`allocate_stack`] for the same size, from any host
//! thread.
//!
//! Each stack is mapped with one extra page below it, which is left
//! inaccessible. A thread that overflows its stack faults on this guard
//! page, rather than writing over whatever memory lies below.

use crate::Error;
use log::trace;
use spin::Mutex;
use std::ptr::{self, NonNull};

/// The page size assumed if the host refuses to
/// report one.
///
const FALLBACK_PAGE_SIZE: usize = 4096;

/// The maximum number of released stacks kept for
/// reuse. Further stacks are unmapped.
///
const MAX_DEAD_STACKS: usize = 64;

/// Returns the host's page size.
///
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        return FALLBACK_PAGE_SIZE;
    }

    size as usize
}

/// A thread stack, mapped from the host, with a guard
/// page below it.
///
/// The memory is unmapped when the stack is dropped.
///
#[derive(Debug)]
pub struct Stack {
    // The start of the mapping, which is the
    // guard page.
    base: NonNull<u8>,

    // The length of the mapping, including the
    // guard page.
    mapped: usize,

    // The number of usable bytes, above the
    // guard page.
    size: usize,
}

// Stack is a unique owner of its mapping, exactly
// like a `Box<[u8]>`, so it can move between host
// threads. It is only ever moved while no thread
// is running on it.
//
unsafe impl Send for Stack {}

impl Stack {
    /// Returns the number of usable bytes in the stack.
    ///
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns whether the usable part of the stack
    /// includes the given address. The guard page is
    /// not included.
    ///
    pub fn contains(&self, addr: u64) -> bool {
        let start = self.base.as_ptr() as u64 + (self.mapped - self.size) as u64;
        start <= addr && addr < start + self.size as u64
    }

    /// Returns the address one past the highest byte
    /// of the stack, which is page aligned. As the
    /// stack grows downwards, this is where the stack
    /// pointer starts.
    ///
    pub(crate) fn top(&mut self) -> *mut u64 {
        unsafe { self.base.as_ptr().add(self.mapped) as *mut u64 }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped) };
    }
}

/// DEAD_STACKS is a free list of stacks that have
/// been released by threads that have exited.
///
/// If there is a stack of the right size available
/// in DEAD_STACKS when a new thread is created, it
/// is used instead of mapping a new stack.
///
static DEAD_STACKS: Mutex<Vec<Stack>> = Mutex::new(Vec::new());

/// Rounds `size` up to a whole number of pages.
///
fn align_size(size: usize, page_size: usize) -> Option<usize> {
    size.checked_add(page_size - 1).map(|size| size & !(page_size - 1))
}

/// Maps a new stack with `size` usable bytes, plus the
/// guard page.
///
fn map_stack(size: usize, page_size: usize) -> Result<Stack, Error> {
    let mapped = size.checked_add(page_size).ok_or(Error::InvalidArgument)?;
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            mapped,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(Error::ResourceExhausted);
    }

    let base = match NonNull::new(base as *mut u8) {
        Some(base) => base,
        None => return Err(Error::ResourceExhausted),
    };

    // From here, dropping the stack unmaps it.
    let stack = Stack { base, mapped, size };

    let guarded = unsafe {
        libc::mprotect(stack.base.as_ptr() as *mut libc::c_void, page_size, libc::PROT_NONE)
    };
    if guarded != 0 {
        return Err(Error::ResourceExhausted);
    }

    Ok(stack)
}

/// Allocates a stack of at least `size` bytes.
///
/// The size is rounded up to a whole number of pages.
/// Fresh stacks are zeroed.
///
pub fn allocate_stack(size: usize) -> Result<Stack, Error> {
    let page_size = page_size();
    let size = match align_size(size, page_size) {
        Some(size) if size > 0 => size,
        _ => return Err(Error::InvalidArgument),
    };

    // Check whether we can just recycle an old stack.
    // We use an extra scope so we don't hold the lock
    // on DEAD_STACKS for unnecessarily long.
    {
        let mut stacks = DEAD_STACKS.lock();
        if let Some(index) = stacks.iter().position(|stack| stack.size == size) {
            trace!("reusing dead stack of {} bytes", size);
            return Ok(stacks.swap_remove(index));
        }
    }

    map_stack(size, page_size)
}

/// Releases the given stack, so it can be reused
/// later.
///
pub fn free_stack(stack: Stack) {
    let mut stacks = DEAD_STACKS.lock();
    if stacks.len() < MAX_DEAD_STACKS {
        stacks.push(stack);
        return;
    }

    // Unmap the memory without holding the lock.
    drop(stacks);
    drop(stack);
}
