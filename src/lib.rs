// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end harness for the tapcheck stack over a TAP interface.
// Author: Lukas Bower

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! End-to-end checks for the user-space TCP/IP stack.
//!
//! The harness attaches a [`Manager`] to a TAP interface, brings its address
//! up (static or DHCP) and then runs the selected scenarios in order: an HTTP
//! server with WebSocket echo exercised by an external client, an HTTP fetch,
//! and an MQTT round trip. Every assertion goes through [`check!`], which
//! stops the run at the first failure.

pub mod background;
pub mod config;
pub mod error;
pub mod pacing;
pub mod report;
pub mod scenario;
pub mod setup;
pub mod tap;
pub mod trust;

use log::info;
use tapcheck_stack::Manager;

pub use config::{HarnessConfig, ScenarioKind};
pub use error::HarnessError;
pub use pacing::PollBudget;
pub use tap::{open_tap, TapDriver};

/// Bring the interface up and run every scenario selected in `cfg`.
pub fn run_scenarios(mgr: &mut Manager, cfg: &HarnessConfig) -> Result<(), HarnessError> {
    cfg.validate()?;
    let ip = setup::await_address(mgr, pacing::LEASE_BUDGET);
    for kind in &cfg.scenarios {
        let before = report::checks_run();
        info!("scenario {} starting", kind.name());
        match kind {
            ScenarioKind::HttpServer => scenario::http_server::run(mgr, cfg, ip)?,
            ScenarioKind::HttpClient => scenario::http_client::run(mgr, cfg)?,
            ScenarioKind::Mqtt => scenario::mqtt::run(mgr, cfg)?,
        }
        info!(
            "scenario {} passed ({} checks)",
            kind.name(),
            report::checks_run() - before
        );
    }
    Ok(())
}
