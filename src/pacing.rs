// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bounded poll loops with fixed pacing and a wall-clock ceiling.
// Author: Lukas Bower

//! Bounded waiting.
//!
//! Every wait in the harness is an iteration count with a fixed pause per
//! iteration. The product is also enforced as a wall-clock ceiling, so a
//! slow poll cannot stretch a scenario past its budget.

use std::thread;
use std::time::{Duration, Instant};

use log::trace;
use tapcheck_stack::Manager;
use thiserror::Error;

/// Iterations and per-iteration pause for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Maximum number of poll iterations.
    pub iterations: u32,
    /// Pause after each poll.
    pub pacing: Duration,
}

/// Budget for a single scenario: 500 polls, 10 ms apart (about 5 s).
pub const SCENARIO_BUDGET: PollBudget = PollBudget::new(500, Duration::from_millis(10));

/// Budget for obtaining a DHCP lease.
pub const LEASE_BUDGET: PollBudget = PollBudget::new(500, Duration::from_millis(10));

/// Poll timeout used while waiting for a lease.
pub const LEASE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

impl PollBudget {
    /// Budget of `iterations` polls separated by `pacing`.
    #[must_use]
    pub const fn new(iterations: u32, pacing: Duration) -> Self {
        Self { iterations, pacing }
    }

    /// Total wall-clock time the budget allows.
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        self.pacing.saturating_mul(self.iterations)
    }

    /// Instant at which a wait started now must give up.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.ceiling()
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        SCENARIO_BUDGET
    }
}

/// A bounded wait ran out before its condition held.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("condition not met after {iterations} polls ({elapsed:?})")]
pub struct TimedOut {
    /// Polls performed.
    pub iterations: u32,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

/// Poll `mgr` until `done` holds or `budget` is spent.
///
/// Returns the number of polls it took.
pub fn drive<F>(mgr: &mut Manager, budget: PollBudget, done: F) -> Result<u32, TimedOut>
where
    F: FnMut(&mut Manager) -> bool,
{
    drive_with_timeout(mgr, budget, Duration::ZERO, done)
}

/// Like [`drive`], passing `poll_timeout` to every [`Manager::poll`].
pub fn drive_with_timeout<F>(
    mgr: &mut Manager,
    budget: PollBudget,
    poll_timeout: Duration,
    mut done: F,
) -> Result<u32, TimedOut>
where
    F: FnMut(&mut Manager) -> bool,
{
    let started = Instant::now();
    let deadline = started + budget.ceiling();
    let mut iterations = 0;
    while iterations < budget.iterations {
        if done(mgr) {
            return Ok(iterations);
        }
        if Instant::now() >= deadline {
            break;
        }
        mgr.poll(poll_timeout);
        thread::sleep(budget.pacing);
        iterations += 1;
    }
    if done(mgr) {
        return Ok(iterations);
    }
    trace!("bounded wait expired after {iterations} polls");
    Err(TimedOut {
        iterations,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tapcheck_stack::{AddressMode, EthernetAddress, LinkDownDriver, NetIfConfig, StaticAddress};

    use super::*;

    fn idle_manager() -> Manager {
        let config = NetIfConfig {
            mac: EthernetAddress([2, 0, 0, 0, 0, 1]),
            address: AddressMode::Static(StaticAddress {
                ip: Ipv4Addr::new(10, 9, 0, 1),
                mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: None,
                dns: Vec::new(),
            }),
        };
        Manager::new(config, Box::new(LinkDownDriver))
    }

    #[test]
    fn default_budget_is_five_seconds() {
        let budget = PollBudget::default();
        assert_eq!(budget.iterations, 500);
        assert_eq!(budget.ceiling(), Duration::from_secs(5));
    }

    #[test]
    fn drive_stops_as_soon_as_condition_holds() {
        let mut mgr = idle_manager();
        let mut calls = 0;
        let polls = drive(&mut mgr, PollBudget::new(50, Duration::from_millis(1)), |_| {
            calls += 1;
            calls == 3
        })
        .expect("condition met");
        assert_eq!(polls, 2);
    }

    #[test]
    fn drive_gives_up_after_budget() {
        let mut mgr = idle_manager();
        let budget = PollBudget::new(5, Duration::from_millis(1));
        let err = drive(&mut mgr, budget, |_| false).expect_err("never satisfied");
        assert!(err.iterations <= 5);
        assert!(mgr.telemetry().polls >= 1);
    }

    #[test]
    fn wall_clock_ceiling_caps_slow_polls() {
        let mut mgr = idle_manager();
        let budget = PollBudget::new(1000, Duration::from_millis(1));
        let started = Instant::now();
        let err = drive_with_timeout(&mut mgr, budget, Duration::from_millis(50), |_| false)
            .expect_err("never satisfied");
        assert!(err.iterations < 1000);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
