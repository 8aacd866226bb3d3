// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Keep the manager polled while the foreground blocks on a child process.
// Author: Lukas Bower

//! Background polling.
//!
//! The poller thread holds the only mutable borrow of the manager for the
//! lifetime of the scope, so the foreground cannot poll concurrently. The
//! poller stops when the foreground finishes or its own budget is spent.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tapcheck_stack::Manager;

use crate::error::HarnessError;
use crate::pacing::PollBudget;

const POLLER_NAME: &str = "tapcheck-poller";

/// Run `foreground` while a dedicated thread polls `mgr`.
///
/// The poller makes at most `budget.iterations` polls, pausing
/// `budget.pacing` after each, and exits early once the foreground returns.
/// A panic on the poller thread is resumed on the caller.
pub fn with_background_poller<T, F>(mgr: &mut Manager, budget: PollBudget, foreground: F) -> Result<T, HarnessError>
where
    F: FnOnce() -> T,
{
    let stop = AtomicBool::new(false);
    thread::scope(|scope| {
        let poller = thread::Builder::new()
            .name(POLLER_NAME.into())
            .spawn_scoped(scope, || poll_until_stopped(mgr, budget, &stop))
            .map_err(HarnessError::Spawn)?;
        let value = foreground();
        stop.store(true, Ordering::Release);
        match poller.join() {
            Ok(polls) => debug!("{POLLER_NAME} stopped after {polls} polls"),
            Err(payload) => panic::resume_unwind(payload),
        }
        Ok(value)
    })
}

fn poll_until_stopped(mgr: &mut Manager, budget: PollBudget, stop: &AtomicBool) -> u32 {
    let deadline = Instant::now() + budget.ceiling();
    let mut polls = 0;
    while polls < budget.iterations && !stop.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            break;
        }
        mgr.poll(Duration::ZERO);
        thread::sleep(budget.pacing);
        polls += 1;
    }
    if polls == budget.iterations || Instant::now() >= deadline {
        warn!("{POLLER_NAME} budget exhausted after {polls} polls");
    }
    polls
}
