// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// A thread that overflows its stack must fault on
// the guard page below it. The overflow runs in a
// child process, which re-runs this test binary.

use std::env;
use std::hint::black_box;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use uthread::{create, join, start_with, Config, MIN_STACK_SIZE};

const OVERFLOW_CHILD: &str = "UTHREAD_OVERFLOW_CHILD";

fn recurse(depth: usize) -> usize {
    let frame = black_box([depth as u8; 1024]);
    if depth == 0 {
        return frame[0] as usize;
    }

    recurse(depth - 1) + black_box(frame)[1] as usize
}

#[test]
fn overflowing_thread() {
    // Only the child process overflows.
    if env::var_os(OVERFLOW_CHILD).is_none() {
        return;
    }

    start_with(Config {
        stack_size: MIN_STACK_SIZE,
        ..Config::default()
    })
    .unwrap();

    // Heap memory that an unguarded overflow
    // would write over.
    let canaries: Vec<Vec<u8>> = (0..64).map(|_| vec![0xa5; 4096]).collect();

    let worker = create(|| recurse(1024) as i32).unwrap();
    let _ = join(worker);
    assert!(canaries.iter().flatten().all(|byte| *byte == 0xa5));
}

#[test]
fn stack_overflow_hits_guard_page() {
    let status = Command::new(env::current_exe().unwrap())
        .args(["--exact", "overflowing_thread", "--nocapture", "--test-threads=1"])
        .env(OVERFLOW_CHILD, "1")
        .status()
        .unwrap();

    assert_eq!(status.signal(), Some(libc::SIGSEGV));
}
