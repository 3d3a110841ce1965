// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! A suspended thread's state is its stack pointer. Everything else the
//! System V ABI expects to survive a call (the callee-saved registers,
//! plus the MXCSR and x87 control words) is pushed onto the thread's own
//! stack before switching, and popped off again when it resumes.

use crate::thread::stacks::Stack;
use core::arch::global_asm;

global_asm!(
    ".pushsection .text.uthread_switch,\"ax\",@progbits",
    // uthread_switch_stack(current: *mut u64, new: *const u64)
    //
    // Saves the current thread's state onto its stack,
    // writes the stack pointer to `current`, then loads
    // the stack pointer from `new` and restores that
    // thread's state, returning into it.
    ".global uthread_switch_stack",
    ".p2align 4",
    "uthread_switch_stack:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    sub rsp, 8",
    "    stmxcsr dword ptr [rsp]",
    "    fnstcw word ptr [rsp + 4]",
    "    mov qword ptr [rdi], rsp",
    "    mov rsp, qword ptr [rsi]",
    "    ldmxcsr dword ptr [rsp]",
    "    fldcw word ptr [rsp + 4]",
    "    add rsp, 8",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    // uthread_start_thread
    //
    // The first return address of a new thread. Pops
    // the thread's entry point, aligns the stack, and
    // calls it. The entry point must never return.
    ".global uthread_start_thread",
    ".p2align 4",
    "uthread_start_thread:",
    "    pop rax",
    "    and rsp, -16",
    "    call rax",
    "    ud2",
    ".popsection",
);

// The following functions are implemented in the
// assembly above.
//
extern "sysv64" {
    fn uthread_switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

    fn uthread_start_thread() -> !;
}

/// The default MXCSR value: all exceptions masked,
/// round to nearest.
///
const DEFAULT_MXCSR: u64 = 0x1f80;

/// The default x87 control word: all exceptions
/// masked, double extended precision, round to
/// nearest.
///
const DEFAULT_FPU_CONTROL_WORD: u64 = 0x037f;

/// The saved execution state of a thread that is not
/// currently running.
///
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    // The thread's saved stack pointer. While the
    // thread is executing, this value is stale.
    stack_pointer: u64,
}

/// push_stack is used to build a new thread's stack
/// without having to drop down to assembly. These
/// values are then popped off in uthread_switch_stack
/// when switching to the new thread for the first
/// time.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

/// Prepares `context` so that the first switch to it
/// runs `entry_point` on `stack`.
///
pub fn init_context(
    context: &mut Context,
    stack: &mut Stack,
    entry_point: extern "sysv64" fn() -> !,
) {
    let rsp = unsafe {
        // The top of the stack is page aligned.
        let mut rsp = stack.top();

        // Padding, so the stack is aligned again
        // once uthread_start_thread pops the entry
        // point.
        rsp = push_stack(rsp, 0);

        // The entry point, popped by uthread_start_thread.
        rsp = push_stack(rsp, entry_point as usize as u64);

        // The return address and initial registers
        // to be loaded by uthread_switch_stack.
        rsp = push_stack(rsp, uthread_start_thread as usize as u64); // RIP.
        rsp = push_stack(rsp, 0); // Initial RBP.
        rsp = push_stack(rsp, 0); // Initial RBX.
        rsp = push_stack(rsp, 0); // Initial R12.
        rsp = push_stack(rsp, 0); // Initial R13.
        rsp = push_stack(rsp, 0); // Initial R14.
        rsp = push_stack(rsp, 0); // Initial R15.
        rsp = push_stack(rsp, DEFAULT_MXCSR | (DEFAULT_FPU_CONTROL_WORD << 32));

        rsp
    };

    debug_assert!(stack.contains(rsp as u64));
    context.stack_pointer = rsp as u64;
}

/// Suspends the calling thread, saving its state into
/// `current`, and resumes the thread saved in `new`.
///
/// `switch_context` returns when another thread later
/// switches back to `current`.
///
/// # Safety
///
/// Both pointers must be valid for the duration of the
/// switch, `new` must have been saved by a previous
/// switch or prepared by [`init_context`], and the
/// stack behind `new` must still be allocated. No
/// references to either context may be live.
///
pub unsafe fn switch_context(current: *mut Context, new: *const Context) {
    uthread_switch_stack(
        core::ptr::addr_of_mut!((*current).stack_pointer),
        core::ptr::addr_of!((*new).stack_pointer),
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::thread::stacks::allocate_stack;
    use crate::MIN_STACK_SIZE;

    extern "sysv64" fn never_run() -> ! {
        unreachable!("test context was switched to");
    }

    #[test]
    fn test_init_context_frame() {
        let mut stack = allocate_stack(MIN_STACK_SIZE).unwrap();
        let top = stack.top() as u64;
        let mut context = Context::default();
        init_context(&mut context, &mut stack, never_run);

        // Ten words were pushed.
        assert_eq!(context.stack_pointer, top - 10 * 8);
        assert_eq!(top % 16, 0);

        let frame = context.stack_pointer as *const u64;
        unsafe {
            assert_eq!(*frame, DEFAULT_MXCSR | (DEFAULT_FPU_CONTROL_WORD << 32));
            assert_eq!(*frame.add(7), uthread_start_thread as usize as u64);
            assert_eq!(*frame.add(8), never_run as usize as u64);
            assert_eq!(*frame.add(9), 0);
        }
    }
}
