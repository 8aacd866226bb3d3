// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Interface addressing configuration and live address state.
// Author: Lukas Bower

//! Interface addressing.
//!
//! [`NetIfConfig`] selects static or DHCP addressing when a manager is built;
//! [`NetIf`] reflects the address the interface currently holds.

use std::net::Ipv4Addr;

use smoltcp::wire::EthernetAddress;

use crate::error::StackError;

/// Statically assigned IPv4 parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddress {
    /// Interface address.
    pub ip: Ipv4Addr,
    /// Network mask in dotted-quad form.
    pub mask: Ipv4Addr,
    /// Default gateway, if any.
    pub gateway: Option<Ipv4Addr>,
    /// Resolvers used for name lookups.
    pub dns: Vec<Ipv4Addr>,
}

impl StaticAddress {
    /// Prefix length equivalent of [`Self::mask`].
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.mask).count_ones() as u8
    }
}

/// How the interface obtains its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressMode {
    /// Fixed address supplied up front.
    Static(StaticAddress),
    /// Address leased from a DHCP server on the link.
    Dhcp,
}

/// Configuration for the interface owned by a [`crate::Manager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetIfConfig {
    /// Hardware address presented on the link.
    pub mac: EthernetAddress,
    /// Addressing mode.
    pub address: AddressMode,
}

/// Parse a colon separated MAC address such as `00:00:01:02:03:78`.
pub fn parse_mac(text: &str) -> Result<EthernetAddress, StackError> {
    let mut octets = [0u8; 6];
    let mut parts = text.split(':');
    for octet in &mut octets {
        let part = parts
            .next()
            .filter(|part| part.len() == 2)
            .ok_or_else(|| StackError::InvalidMac(text.to_owned()))?;
        *octet =
            u8::from_str_radix(part, 16).map_err(|_| StackError::InvalidMac(text.to_owned()))?;
    }
    if parts.next().is_some() {
        return Err(StackError::InvalidMac(text.to_owned()));
    }
    Ok(EthernetAddress(octets))
}

/// Address state of the interface.
#[derive(Debug, Clone)]
pub struct NetIf {
    mac: EthernetAddress,
    dhcp: bool,
    ip: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
}

impl NetIf {
    pub(crate) fn new(config: &NetIfConfig) -> Self {
        match &config.address {
            AddressMode::Static(addr) => Self {
                mac: config.mac,
                dhcp: false,
                ip: addr.ip,
                mask: addr.mask,
                gateway: addr.gateway,
                dns: addr.dns.clone(),
            },
            AddressMode::Dhcp => Self {
                mac: config.mac,
                dhcp: true,
                ip: Ipv4Addr::UNSPECIFIED,
                mask: Ipv4Addr::UNSPECIFIED,
                gateway: None,
                dns: Vec::new(),
            },
        }
    }

    pub(crate) fn apply_lease(
        &mut self,
        ip: Ipv4Addr,
        prefix_len: u8,
        gateway: Option<Ipv4Addr>,
        dns: Vec<Ipv4Addr>,
    ) {
        self.ip = ip;
        self.mask = mask_from_prefix(prefix_len);
        self.gateway = gateway;
        self.dns = dns;
    }

    pub(crate) fn clear_lease(&mut self) {
        self.ip = Ipv4Addr::UNSPECIFIED;
        self.mask = Ipv4Addr::UNSPECIFIED;
        self.gateway = None;
        self.dns.clear();
    }

    /// Hardware address.
    #[must_use]
    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    /// Current address; unspecified until configured.
    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Current network mask.
    #[must_use]
    pub fn mask(&self) -> Ipv4Addr {
        self.mask
    }

    /// Current default gateway.
    #[must_use]
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    /// Resolvers in use.
    #[must_use]
    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns
    }

    /// Whether the interface holds a non-zero address.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.ip.is_unspecified()
    }

    /// Whether the address comes from DHCP.
    #[must_use]
    pub fn uses_dhcp(&self) -> bool {
        self.dhcp
    }
}

fn mask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - u32::from(len)),
    };
    Ipv4Addr::from(bits)
}
