// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Address bootstrapping before scenarios run.
// Author: Lukas Bower

//! Address bootstrapping.

use std::net::Ipv4Addr;

use log::{error, info};
use tapcheck_stack::Manager;

use crate::check;
use crate::pacing::{drive_with_timeout, PollBudget, LEASE_POLL_TIMEOUT};

/// Make sure the interface has an address and return it.
///
/// A DHCP interface starts unconfigured and is polled until a lease arrives
/// or `budget` runs out. A static interface must already be configured.
/// Either way the final check requires a usable address.
pub fn await_address(mgr: &mut Manager, budget: PollBudget) -> Ipv4Addr {
    if mgr.netif().uses_dhcp() {
        check!(!mgr.netif().is_configured());
        match drive_with_timeout(mgr, budget, LEASE_POLL_TIMEOUT, |mgr| mgr.netif().is_configured()) {
            Ok(polls) => info!("DHCP lease after {polls} polls"),
            Err(err) => error!("no DHCP lease: {err}"),
        }
    } else {
        check!(mgr.netif().is_configured());
        mgr.poll(LEASE_POLL_TIMEOUT);
    }
    let netif = mgr.netif();
    check!(netif.is_configured());
    info!(
        "interface {} up: ip {} mask {} gw {:?} dns {:?}",
        netif.mac(),
        netif.ip(),
        netif.mask(),
        netif.gateway(),
        netif.dns_servers()
    );
    netif.ip()
}
