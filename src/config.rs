// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Harness configuration and its defaults.
// Author: Lukas Bower

//! Harness configuration.
//!
//! [`HarnessConfig::default`] reproduces a live run against `tap0`: address
//! and resolver from DHCP, the server scenario on port 12347, and the public
//! HTTP and MQTT endpoints. [`HarnessConfig::static_address`] is the fallback
//! used when a static address is requested. The binary overrides fields from its
//! command line and `TAPCHECK_*` environment variables.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::ValueEnum;
use tapcheck_stack::endpoint::url_host;
use tapcheck_stack::{AddressMode, EthernetAddress, NetIfConfig, StaticAddress};

use crate::error::HarnessError;
use crate::pacing::PollBudget;

/// TAP interface attached by default.
pub const DEFAULT_IFACE: &str = "tap0";
/// Tunnel clone device.
pub const DEFAULT_DEVICE: &str = "/dev/net/tun";
/// MAC address given to the stack's interface.
pub const DEFAULT_MAC: EthernetAddress = EthernetAddress([0x00, 0x00, 0x01, 0x02, 0x03, 0x78]);
/// Address used when static configuration is requested.
pub const DEFAULT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 32, 2);
/// Netmask paired with [`DEFAULT_IP`].
pub const DEFAULT_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
/// Gateway paired with [`DEFAULT_IP`].
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 32, 1);
/// Resolver used by static configuration when none is given.
pub const DEFAULT_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
/// Port the server scenario listens on.
pub const DEFAULT_SERVER_PORT: u16 = 12347;
/// Client command run against the listener.
pub const DEFAULT_CLIENT_CMD: &str = "./scripts/check_server.sh {tls_flags} {scheme}://{ip}:{port}";
/// Plain HTTP endpoint fetched by the client scenario.
pub const DEFAULT_HTTP_URL: &str = "http://cesanta.com";
/// Secure endpoint fetched when TLS is enabled.
pub const DEFAULT_HTTPS_URL: &str = "https://cesanta.com";
/// Path requested by the client scenario.
pub const DEFAULT_HTTP_PATH: &str = "/robots.txt";
/// MQTT broker used by the MQTT scenario.
pub const DEFAULT_MQTT_URL: &str = "mqtt://broker.hivemq.com:1883";
/// Secure MQTT broker used when TLS is enabled.
pub const DEFAULT_MQTTS_URL: &str = "mqtts://broker.hivemq.com:8883";

/// One protocol scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum ScenarioKind {
    /// HTTP server with WebSocket echo, exercised by an external client.
    HttpServer,
    /// HTTP fetch from a remote endpoint.
    HttpClient,
    /// MQTT connect, subscribe, publish and disconnect.
    Mqtt,
}

impl ScenarioKind {
    /// Every scenario in run order.
    pub const ALL: [ScenarioKind; 3] = [ScenarioKind::HttpServer, ScenarioKind::HttpClient, ScenarioKind::Mqtt];

    /// Short name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ScenarioKind::HttpServer => "http-server",
            ScenarioKind::HttpClient => "http-client",
            ScenarioKind::Mqtt => "mqtt",
        }
    }
}

/// Everything a harness run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Tunnel clone device.
    pub device: PathBuf,
    /// TAP interface name.
    pub iface: String,
    /// Interface MAC and addressing mode.
    pub netif: NetIfConfig,
    /// Listener port for the server scenario.
    pub server_port: u16,
    /// Client command template with `{scheme}`, `{ip}`, `{port}` and `{tls_flags}`.
    pub client_cmd: String,
    /// Directory served for unmatched request paths.
    pub data_dir: PathBuf,
    /// Root of the trust material store.
    pub trust_root: PathBuf,
    /// URL fetched by the client scenario.
    pub http_url: String,
    /// Path requested by the client scenario.
    pub http_path: String,
    /// Status the client scenario must observe.
    pub expect_status: u16,
    /// Broker URL for the MQTT scenario.
    pub mqtt_url: String,
    /// Run servers and clients over TLS.
    pub tls: bool,
    /// Scenarios to run, in order.
    pub scenarios: Vec<ScenarioKind>,
    /// Budget applied to each scenario wait.
    pub budget: PollBudget,
}

impl HarnessConfig {
    /// Defaults for a plain or TLS run.
    #[must_use]
    pub fn with_tls(tls: bool) -> Self {
        let (http_url, mqtt_url, expect_status) = if tls {
            (DEFAULT_HTTPS_URL, DEFAULT_MQTTS_URL, 200)
        } else {
            (DEFAULT_HTTP_URL, DEFAULT_MQTT_URL, 301)
        };
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            iface: DEFAULT_IFACE.to_owned(),
            netif: NetIfConfig {
                mac: DEFAULT_MAC,
                address: AddressMode::Dhcp,
            },
            server_port: DEFAULT_SERVER_PORT,
            client_cmd: DEFAULT_CLIENT_CMD.to_owned(),
            data_dir: PathBuf::from("data"),
            trust_root: PathBuf::from("."),
            http_url: http_url.to_owned(),
            http_path: DEFAULT_HTTP_PATH.to_owned(),
            expect_status,
            mqtt_url: mqtt_url.to_owned(),
            tls,
            scenarios: ScenarioKind::ALL.to_vec(),
            budget: PollBudget::default(),
        }
    }

    /// Static addressing used when DHCP is not wanted.
    #[must_use]
    pub fn static_address() -> StaticAddress {
        StaticAddress {
            ip: DEFAULT_IP,
            mask: DEFAULT_MASK,
            gateway: Some(DEFAULT_GATEWAY),
            dns: vec![DEFAULT_DNS],
        }
    }

    /// Scheme the server scenario listens with.
    #[must_use]
    pub fn server_scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Listener URL for the server scenario.
    #[must_use]
    pub fn listen_url(&self) -> String {
        format!("{}://0.0.0.0:{}", self.server_scheme(), self.server_port)
    }

    /// Client command with placeholders filled in for `ip`.
    #[must_use]
    pub fn client_command(&self, ip: Ipv4Addr) -> String {
        let tls_flags = if self.tls { "--insecure" } else { "" };
        self.client_cmd
            .replace("{tls_flags}", tls_flags)
            .replace("{scheme}", self.server_scheme())
            .replace("{ip}", &ip.to_string())
            .replace("{port}", &self.server_port.to_string())
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Raw request sent by the client scenario.
    pub fn http_request(&self) -> Result<String, HarnessError> {
        let host = url_host(&self.http_url)
            .ok_or_else(|| HarnessError::Config(format!("http url {:?} has no host", self.http_url)))?;
        Ok(format!("GET {} HTTP/1.0\r\nHost: {host}\r\n\r\n", self.http_path))
    }

    /// Reject combinations this build cannot run.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.tls && !tapcheck_stack::tls::available() {
            return Err(HarnessError::Config("TLS requested but built without the `tls` feature".into()));
        }
        if self.server_port == 0 {
            return Err(HarnessError::Config("server port must be non-zero".into()));
        }
        if self.scenarios.is_empty() {
            return Err(HarnessError::Config("no scenarios selected".into()));
        }
        if !self.http_path.starts_with('/') {
            return Err(HarnessError::Config(format!("http path {:?} must start with '/'", self.http_path)));
        }
        Ok(())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::with_tls(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_defaults() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.iface, "tap0");
        assert_eq!(cfg.expect_status, 301);
        assert_eq!(cfg.listen_url(), "http://0.0.0.0:12347");
        assert_eq!(
            cfg.http_request().expect("request"),
            "GET /robots.txt HTTP/1.0\r\nHost: cesanta.com\r\n\r\n"
        );
        assert_eq!(cfg.scenarios, ScenarioKind::ALL);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_addressing_can_resolve_names() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.netif.address, AddressMode::Dhcp);
        let fallback = HarnessConfig::static_address();
        assert_eq!(fallback.ip, DEFAULT_IP);
        assert_eq!(fallback.gateway, Some(DEFAULT_GATEWAY));
        assert_eq!(fallback.dns, vec![Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[test]
    fn tls_defaults_switch_endpoints() {
        let cfg = HarnessConfig::with_tls(true);
        assert_eq!(cfg.expect_status, 200);
        assert!(cfg.http_url.starts_with("https://"));
        assert!(cfg.mqtt_url.starts_with("mqtts://"));
        assert_eq!(cfg.validate().is_ok(), tapcheck_stack::tls::available());
    }

    #[test]
    fn client_command_fills_placeholders() {
        let mut cfg = HarnessConfig::default();
        let ip = Ipv4Addr::new(192, 168, 32, 2);
        assert_eq!(cfg.client_command(ip), "./scripts/check_server.sh http://192.168.32.2:12347");
        cfg.tls = true;
        assert_eq!(
            cfg.client_command(ip),
            "./scripts/check_server.sh --insecure https://192.168.32.2:12347"
        );
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut cfg = HarnessConfig::default();
        cfg.scenarios.clear();
        assert!(matches!(cfg.validate(), Err(HarnessError::Config(_))));
        let mut cfg = HarnessConfig::default();
        cfg.http_path = "robots.txt".into();
        assert!(cfg.validate().is_err());
        let mut cfg = HarnessConfig::default();
        cfg.http_url = "not a url".into();
        assert!(cfg.http_request().is_err());
    }
}
