// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Command line entry point for the tapcheck harness.
// Author: Lukas Bower

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for `tapcheck`: attach to a TAP interface and run the
//! end-to-end scenarios against the user-space stack.

use std::env;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, LevelFilter};
use tapcheck::config::HarnessConfig;
use tapcheck::{check, report, run_scenarios, ScenarioKind, TapDriver};
use tapcheck_stack::{parse_mac, AddressMode, Manager, StaticAddress};

#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "End-to-end checks for the tapcheck stack over a TAP interface",
    long_about = None
)]
struct Cli {
    /// Tunnel clone device [env: TAPCHECK_DEVICE].
    #[arg(long)]
    device: Option<PathBuf>,

    /// TAP interface to attach [env: TAPCHECK_IFACE].
    #[arg(long)]
    iface: Option<String>,

    /// Interface MAC address [env: TAPCHECK_MAC].
    #[arg(long)]
    mac: Option<String>,

    /// Obtain the address through DHCP (the default).
    #[arg(long, default_value_t = false)]
    dhcp: bool,

    /// Use the static fallback address 192.168.32.2/24 with resolver 8.8.8.8.
    #[arg(long = "static", conflicts_with = "dhcp", default_value_t = false)]
    static_addr: bool,

    /// Static interface address; selects static configuration [env: TAPCHECK_IP].
    #[arg(long = "static-ip", conflicts_with = "dhcp")]
    static_ip: Option<Ipv4Addr>,

    /// Static netmask [env: TAPCHECK_MASK].
    #[arg(long, conflicts_with = "dhcp")]
    mask: Option<Ipv4Addr>,

    /// Static default gateway [env: TAPCHECK_GATEWAY].
    #[arg(long, conflicts_with = "dhcp")]
    gateway: Option<Ipv4Addr>,

    /// DNS resolver for static configuration, 8.8.8.8 when omitted; repeatable.
    #[arg(long, conflicts_with = "dhcp")]
    dns: Vec<Ipv4Addr>,

    /// Port for the server scenario [env: TAPCHECK_PORT].
    #[arg(long)]
    port: Option<u16>,

    /// Client command template for the server scenario [env: TAPCHECK_CLIENT_CMD].
    #[arg(long = "client-cmd")]
    client_cmd: Option<String>,

    /// Directory served by the server scenario [env: TAPCHECK_DATA_DIR].
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Root of the certificate store [env: TAPCHECK_TRUST_ROOT].
    #[arg(long = "trust-root")]
    trust_root: Option<PathBuf>,

    /// URL fetched by the client scenario [env: TAPCHECK_HTTP_URL].
    #[arg(long = "http-url")]
    http_url: Option<String>,

    /// Path requested by the client scenario [env: TAPCHECK_HTTP_PATH].
    #[arg(long = "http-path")]
    http_path: Option<String>,

    /// Status the client scenario must observe [env: TAPCHECK_EXPECT_STATUS].
    #[arg(long = "expect-status")]
    expect_status: Option<u16>,

    /// Broker URL for the MQTT scenario [env: TAPCHECK_MQTT_URL].
    #[arg(long = "mqtt-url")]
    mqtt_url: Option<String>,

    /// Run only these scenarios; repeatable.
    #[arg(long, value_enum)]
    only: Vec<ScenarioKind>,

    /// Serve and fetch over TLS.
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<T>()
                .map(Some)
                .map_err(|err| anyhow!("invalid {key} value '{trimmed}': {err}"))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed to read {key}: {err}")),
    }
}

fn env_override<T>(cli_value: Option<T>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    if cli_value.is_some() {
        return Ok(cli_value);
    }
    parse_env(key)
}

fn build_config(cli: Cli) -> Result<HarnessConfig> {
    let mut cfg = HarnessConfig::with_tls(cli.tls);
    if let Some(device) = env_override(cli.device, "TAPCHECK_DEVICE")? {
        cfg.device = device;
    }
    if let Some(iface) = env_override(cli.iface, "TAPCHECK_IFACE")? {
        cfg.iface = iface;
    }
    if let Some(mac) = env_override::<String>(cli.mac, "TAPCHECK_MAC")? {
        cfg.netif.mac = parse_mac(&mac).with_context(|| format!("invalid MAC address '{mac}'"))?;
    }
    let ip = env_override(cli.static_ip, "TAPCHECK_IP")?;
    let mask = env_override(cli.mask, "TAPCHECK_MASK")?;
    let gateway = env_override(cli.gateway, "TAPCHECK_GATEWAY")?;
    let wants_static = cli.static_addr || ip.is_some() || mask.is_some() || gateway.is_some() || !cli.dns.is_empty();
    if cli.dhcp && wants_static {
        return Err(anyhow!("--dhcp cannot be combined with static address settings"));
    }
    if wants_static {
        let fallback = HarnessConfig::static_address();
        cfg.netif.address = AddressMode::Static(StaticAddress {
            ip: ip.unwrap_or(fallback.ip),
            mask: mask.unwrap_or(fallback.mask),
            gateway: gateway.or(fallback.gateway),
            dns: if cli.dns.is_empty() { fallback.dns } else { cli.dns },
        });
    } else {
        cfg.netif.address = AddressMode::Dhcp;
    }
    if let Some(port) = env_override(cli.port, "TAPCHECK_PORT")? {
        cfg.server_port = port;
    }
    if let Some(cmd) = env_override(cli.client_cmd, "TAPCHECK_CLIENT_CMD")? {
        cfg.client_cmd = cmd;
    }
    if let Some(dir) = env_override(cli.data_dir, "TAPCHECK_DATA_DIR")? {
        cfg.data_dir = dir;
    }
    if let Some(root) = env_override(cli.trust_root, "TAPCHECK_TRUST_ROOT")? {
        cfg.trust_root = root;
    }
    if let Some(url) = env_override(cli.http_url, "TAPCHECK_HTTP_URL")? {
        cfg.http_url = url;
    }
    if let Some(path) = env_override(cli.http_path, "TAPCHECK_HTTP_PATH")? {
        cfg.http_path = path;
    }
    if let Some(status) = env_override(cli.expect_status, "TAPCHECK_EXPECT_STATUS")? {
        cfg.expect_status = status;
    }
    if let Some(url) = env_override(cli.mqtt_url, "TAPCHECK_MQTT_URL")? {
        cfg.mqtt_url = url;
    }
    if !cli.only.is_empty() {
        let mut only = cli.only;
        only.sort();
        only.dedup();
        cfg.scenarios = only;
    }
    cfg.validate().context("invalid harness configuration")?;
    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cfg = build_config(cli)?;

    let device = tapcheck::open_tap(&cfg.device, &cfg.iface)
        .with_context(|| format!("failed to set up TAP interface {}", cfg.iface))?;
    info!("Opened TAP interface: {}", cfg.iface);

    let mut mgr = Manager::new(cfg.netif.clone(), Box::new(TapDriver::new(device)));
    info!("Init done, starting main loop");
    run_scenarios(&mut mgr, &cfg)?;

    println!("{}", report::summary());

    mgr.free();
    check!(mgr.connection_count() == 0);
    drop(mgr.release_interface());
    Ok(())
}
