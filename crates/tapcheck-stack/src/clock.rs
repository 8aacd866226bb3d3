// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Monotonic clock feeding smoltcp timestamps for the event manager.
// Author: Lukas Bower

use std::time::Instant as StdInstant;

use smoltcp::time::Instant;

/// Monotonic clock measured from manager construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NetworkClock {
    origin: StdInstant,
}

impl NetworkClock {
    pub(crate) fn new() -> Self {
        Self {
            origin: StdInstant::now(),
        }
    }

    /// Current time expressed as a smoltcp instant.
    pub(crate) fn now(&self) -> Instant {
        let micros = i64::try_from(self.origin.elapsed().as_micros()).unwrap_or(i64::MAX);
        Instant::from_micros(micros)
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = NetworkClock::new();
        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = clock.now();
        assert!(second > first);
        assert!(clock.elapsed_ms() >= 2);
    }
}
