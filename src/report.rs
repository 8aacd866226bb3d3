// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fail-fast assertion macro and the run summary.
// Author: Lukas Bower

//! Fail-fast assertions.
//!
//! Every [`check!`](crate::check) bumps a process-wide counter. A false
//! condition prints a `FAILURE` line naming the source location and the
//! expression, then panics; release and dev builds abort on panic, so the
//! process ends with a non-zero status. [`summary`] renders the final line
//! once every scenario has passed.

use std::sync::atomic::{AtomicUsize, Ordering};

static CHECKS: AtomicUsize = AtomicUsize::new(0);

/// Evaluate a condition, counting it and failing fast when it is false.
#[macro_export]
macro_rules! check {
    ($cond:expr $(,)?) => {
        $crate::report::record($cond, file!(), line!(), stringify!($cond))
    };
}

/// Record one evaluated check; used by [`check!`](crate::check).
pub fn record(passed: bool, file: &str, line: u32, expr: &str) {
    CHECKS.fetch_add(1, Ordering::SeqCst);
    if !passed {
        fail(file, line, expr);
    }
}

#[cold]
fn fail(file: &str, line: u32, expr: &str) -> ! {
    let message = format!("FAILURE {file}:{line}: {expr}");
    println!("{message}");
    log::error!("{message}");
    panic!("{message}");
}

/// Number of checks evaluated so far.
#[must_use]
pub fn checks_run() -> usize {
    CHECKS.load(Ordering::SeqCst)
}

/// Closing line printed after a clean run.
#[must_use]
pub fn summary() -> String {
    format!("SUCCESS. Total tests: {}", checks_run())
}
