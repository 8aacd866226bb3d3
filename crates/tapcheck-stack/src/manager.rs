// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Event manager owning the smoltcp interface, sockets and connections.
// Author: Lukas Bower

//! Event manager.
//!
//! [`Manager::poll`] is the single driving step: it moves frames between the
//! driver and smoltcp, services DHCP and DNS, accepts inbound connections,
//! pumps connection buffers through their protocol parsers and dispatches
//! events to handlers. Everything happens on the calling thread.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::{Duration, Instant as StdInstant};

use log::{debug, info, trace, warn};
use smoltcp::iface::{Config as IfaceConfig, Interface, PollResult, SocketHandle, SocketSet};
use smoltcp::socket::dns::{self, GetQueryResultError};
use smoltcp::socket::{dhcpv4, tcp};
use smoltcp::wire::{DnsQueryType, HardwareAddress, IpAddress, IpCidr, IpListenEndpoint};

use crate::clock::NetworkClock;
use crate::conn::{Conn, ConnId, Phase, Protocol};
use crate::driver::{Driver, DriverPhy};
use crate::endpoint::{Endpoint, Host};
use crate::error::StackError;
use crate::event::{share, Event, SharedHandler};
use crate::mqtt::{self, MqttOpts, Session};
use crate::netif::{AddressMode, NetIf, NetIfConfig};

/// Receive buffer per TCP socket.
pub const TCP_RX_BUFFER: usize = 16 * 1024;

/// Transmit buffer per TCP socket.
pub const TCP_TX_BUFFER: usize = 16 * 1024;

/// Listening sockets kept armed per listener.
pub const LISTEN_BACKLOG: usize = 4;

/// Longest idle sleep taken inside a single poll.
pub const IDLE_SLICE: Duration = Duration::from_millis(10);

const LINGER: Duration = Duration::from_secs(2);
const EPHEMERAL_FIRST: u16 = 49152;
const EPHEMERAL_LAST: u16 = 65535;
const SCRATCH_LEN: usize = 2048;

/// Snapshot of interface counters refreshed on every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Driver reports a live link.
    pub link_up: bool,
    /// Frames received from the driver.
    pub rx_frames: u64,
    /// Frames accepted by the driver.
    pub tx_frames: u64,
    /// Frames the driver refused.
    pub tx_drops: u64,
    /// Manager uptime at the last poll, in milliseconds.
    pub last_poll_ms: u64,
    /// Number of polls performed.
    pub polls: u64,
}

enum Resolution {
    Started(dns::QueryHandle),
    Pending,
    Resolved(Ipv4Addr),
    Failed(String),
}

/// Owner of the interface, the socket set and every connection.
pub struct Manager {
    clock: NetworkClock,
    phy: DriverPhy,
    iface: Interface,
    sockets: SocketSet<'static>,
    netif: NetIf,
    dhcp: Option<SocketHandle>,
    dns: SocketHandle,
    conns: Vec<Conn>,
    lingering: Vec<(SocketHandle, StdInstant)>,
    next_id: u64,
    next_port: u16,
    telemetry: Telemetry,
}

impl Manager {
    /// Bind an interface to `driver` and prepare addressing per `config`.
    pub fn new(config: NetIfConfig, driver: Box<dyn Driver>) -> Self {
        let clock = NetworkClock::new();
        let mut phy = DriverPhy::new(driver);
        let mut iface_config = IfaceConfig::new(HardwareAddress::Ethernet(config.mac));
        iface_config.random_seed = rand::random();
        let mut iface = Interface::new(iface_config, &mut phy, clock.now());
        let netif = NetIf::new(&config);
        let mut sockets = SocketSet::new(Vec::new());

        let dhcp = match &config.address {
            AddressMode::Static(addr) => {
                apply_address(&mut iface, addr.ip, addr.prefix_len(), addr.gateway);
                info!(
                    "netif {} static {}/{} gw {:?}",
                    config.mac,
                    addr.ip,
                    addr.prefix_len(),
                    addr.gateway
                );
                None
            }
            AddressMode::Dhcp => {
                info!("netif {} requesting DHCP lease", config.mac);
                Some(sockets.add(dhcpv4::Socket::new()))
            }
        };
        let dns = sockets.add(dns::Socket::new(&resolvers(netif.dns_servers()), Vec::new()));

        Self {
            clock,
            phy,
            iface,
            sockets,
            netif,
            dhcp,
            dns,
            conns: Vec::new(),
            lingering: Vec::new(),
            next_id: 1,
            next_port: rand::random_range(EPHEMERAL_FIRST..=EPHEMERAL_LAST),
            telemetry: Telemetry::default(),
        }
    }

    /// Run one servicing step, sleeping up to `timeout` when nothing happened.
    ///
    /// Returns `true` when any frame, socket or connection made progress.
    pub fn poll(&mut self, timeout: Duration) -> bool {
        let mut activity = self.poll_interface();
        activity |= self.service_dhcp();
        activity |= self.service_resolvers();
        activity |= self.service_listeners();
        activity |= self.service_connections();
        activity |= self.poll_interface();
        activity |= self.reap_closed();
        self.reap_lingering();
        self.refresh_telemetry();

        if !activity && !timeout.is_zero() {
            let delay = self
                .iface
                .poll_delay(self.clock.now(), &self.sockets)
                .map_or(timeout, |delay| Duration::from_micros(delay.total_micros()));
            let idle = delay.min(timeout).min(IDLE_SLICE);
            if !idle.is_zero() {
                thread::sleep(idle);
            }
        }
        activity
    }

    // ----- connection constructors ---------------------------------------

    /// Open a raw TCP client connection to `url` (`tcp://host:port`).
    pub fn connect<F>(&mut self, url: &str, handler: F) -> Result<ConnId, StackError>
    where
        F: FnMut(&mut Conn, Event<'_>) + Send + 'static,
    {
        self.open_client(url, Protocol::Raw, share(handler))
    }

    /// Open an HTTP client connection; responses arrive as [`Event::HttpMsg`].
    pub fn http_connect<F>(&mut self, url: &str, handler: F) -> Result<ConnId, StackError>
    where
        F: FnMut(&mut Conn, Event<'_>) + Send + 'static,
    {
        self.open_client(url, Protocol::HttpClient, share(handler))
    }

    /// Open an MQTT 3.1.1 client session; CONNECT is sent once TCP is up.
    pub fn mqtt_connect<F>(&mut self, url: &str, opts: &MqttOpts, handler: F) -> Result<ConnId, StackError>
    where
        F: FnMut(&mut Conn, Event<'_>) + Send + 'static,
    {
        let packet = mqtt::connect_packet(opts)?;
        let session = Session::new(packet, opts.keepalive);
        self.open_client(url, Protocol::Mqtt(session), share(handler))
    }

    /// Listen for raw TCP connections on `url` (`tcp://0.0.0.0:port`).
    pub fn listen<F>(&mut self, url: &str, handler: F) -> Result<ConnId, StackError>
    where
        F: FnMut(&mut Conn, Event<'_>) + Send + 'static,
    {
        self.open_listener(url, Protocol::Raw, share(handler))
    }

    /// Listen for HTTP connections; requests arrive as [`Event::HttpMsg`].
    pub fn http_listen<F>(&mut self, url: &str, handler: F) -> Result<ConnId, StackError>
    where
        F: FnMut(&mut Conn, Event<'_>) + Send + 'static,
    {
        self.open_listener(url, Protocol::HttpServer, share(handler))
    }

    // ----- accessors -------------------------------------------------------

    /// Look up a live connection.
    #[must_use]
    pub fn conn(&self, id: ConnId) -> Option<&Conn> {
        self.conns.iter().find(|conn| conn.id() == id)
    }

    /// Look up a live connection for mutation.
    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Conn> {
        self.conns.iter_mut().find(|conn| conn.id() == id)
    }

    /// Identifiers of all live connections, listeners included.
    #[must_use]
    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.conns.iter().map(Conn::id).collect()
    }

    /// Number of live connections, listeners included.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Interface address state.
    #[must_use]
    pub fn netif(&self) -> &NetIf {
        &self.netif
    }

    /// Counters from the last poll.
    #[must_use]
    pub fn telemetry(&self) -> Telemetry {
        self.telemetry
    }

    /// Close every connection and release their sockets.
    ///
    /// Each connection receives [`Event::Close`]; afterwards
    /// [`Self::connection_count`] is zero.
    pub fn free(&mut self) {
        for conn in &mut self.conns {
            conn.close();
        }
        self.reap_closed();
        self.poll_interface();
        for (handle, _) in self.lingering.drain(..) {
            self.sockets.remove(handle);
        }
        info!("manager released all connections");
    }

    /// Free all connections and hand the driver back to the caller.
    #[must_use]
    pub fn release_interface(mut self) -> Box<dyn Driver> {
        self.free();
        self.phy.into_driver()
    }

    // ----- internals -------------------------------------------------------

    fn allocate_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= EPHEMERAL_LAST {
            EPHEMERAL_FIRST
        } else {
            port + 1
        };
        port
    }

    fn poll_interface(&mut self) -> bool {
        self.iface.poll(self.clock.now(), &mut self.phy, &mut self.sockets) != PollResult::None
    }

    fn dial(&mut self, ip: Ipv4Addr, port: u16) -> Result<(SocketHandle, u16), StackError> {
        let mut socket = tcp_socket();
        let local_port = self.ephemeral_port();
        socket
            .connect(self.iface.context(), (IpAddress::Ipv4(ip.into()), port), local_port)
            .map_err(|err| StackError::Connect {
                target: format!("{ip}:{port}"),
                reason: format!("{err:?}"),
            })?;
        Ok((self.sockets.add(socket), local_port))
    }

    fn open_client(&mut self, url: &str, protocol: Protocol, handler: SharedHandler) -> Result<ConnId, StackError> {
        let endpoint = Endpoint::parse(url)?;
        let phase = match &endpoint.host {
            Host::Addr(_) => Phase::Connecting,
            Host::Name(name) => Phase::Resolving {
                host: name.clone(),
                port: endpoint.port,
                query: None,
            },
        };
        let dialled = match endpoint.host {
            Host::Addr(ip) => Some((self.dial(ip, endpoint.port)?, ip)),
            Host::Name(_) => None,
        };
        let id = self.allocate_id();
        let mut conn = Conn::new(id, protocol, phase, handler);
        conn.wants_tls = endpoint.scheme.is_tls();
        if let Some(((socket, local_port), ip)) = dialled {
            conn.socket = Some(socket);
            conn.local_port = local_port;
            conn.set_remote(SocketAddrV4::new(ip, endpoint.port));
        }
        info!("conn {id} connecting to {url}");
        conn.dispatch(Event::Open);
        self.conns.push(conn);
        Ok(id)
    }

    fn listen_socket(&mut self, ip: Ipv4Addr, port: u16) -> Result<SocketHandle, StackError> {
        let mut socket = tcp_socket();
        let endpoint = IpListenEndpoint {
            addr: (!ip.is_unspecified()).then(|| IpAddress::Ipv4(ip.into())),
            port,
        };
        socket.listen(endpoint).map_err(|err| StackError::Listen {
            port,
            reason: format!("{err:?}"),
        })?;
        Ok(self.sockets.add(socket))
    }

    fn open_listener(&mut self, url: &str, protocol: Protocol, handler: SharedHandler) -> Result<ConnId, StackError> {
        let endpoint = Endpoint::parse(url)?;
        let Host::Addr(ip) = endpoint.host else {
            return Err(StackError::InvalidUrl {
                url: url.to_owned(),
                reason: "listen address must be an IPv4 literal".into(),
            });
        };
        if endpoint.port == 0 {
            return Err(StackError::Listen {
                port: 0,
                reason: "port must be non-zero".into(),
            });
        }
        let mut backlog = Vec::with_capacity(LISTEN_BACKLOG);
        for _ in 0..LISTEN_BACKLOG {
            match self.listen_socket(ip, endpoint.port) {
                Ok(handle) => backlog.push(handle),
                Err(err) => {
                    for handle in backlog {
                        self.sockets.remove(handle);
                    }
                    return Err(err);
                }
            }
        }
        let id = self.allocate_id();
        let mut conn = Conn::new(id, protocol, Phase::Listening, handler);
        conn.backlog = backlog;
        conn.local_port = endpoint.port;
        info!("conn {id} listening on {url}");
        conn.dispatch(Event::Open);
        self.conns.push(conn);
        Ok(id)
    }

    fn service_dhcp(&mut self) -> bool {
        let Some(handle) = self.dhcp else {
            return false;
        };
        let event = self.sockets.get_mut::<dhcpv4::Socket>(handle).poll();
        match event {
            None => false,
            Some(dhcpv4::Event::Configured(config)) => {
                let ip: Ipv4Addr = config.address.address().into();
                let prefix_len = config.address.prefix_len();
                let gateway: Option<Ipv4Addr> = config.router.map(Into::into);
                let dns: Vec<Ipv4Addr> = config.dns_servers.iter().map(|&server| server.into()).collect();
                apply_address(&mut self.iface, ip, prefix_len, gateway);
                self.sockets
                    .get_mut::<dns::Socket>(self.dns)
                    .update_servers(&resolvers(&dns));
                info!("dhcp lease {ip}/{prefix_len} gw {gateway:?} dns {dns:?}");
                self.netif.apply_lease(ip, prefix_len, gateway, dns);
                true
            }
            Some(dhcpv4::Event::Deconfigured) => {
                warn!("dhcp lease lost");
                self.iface.update_ip_addrs(|addrs| addrs.clear());
                let _ = self.iface.routes_mut().remove_default_ipv4_route();
                self.netif.clear_lease();
                true
            }
        }
    }

    fn service_resolvers(&mut self) -> bool {
        let mut activity = false;
        for idx in 0..self.conns.len() {
            let (host, port, query) = match &self.conns[idx].phase {
                Phase::Resolving { host, port, query } => (host.clone(), *port, *query),
                _ => continue,
            };
            if self.conns[idx].close_now() {
                continue;
            }
            let socket = self.sockets.get_mut::<dns::Socket>(self.dns);
            let outcome = match query {
                None => match socket.start_query(self.iface.context(), &host, DnsQueryType::A) {
                    Ok(handle) => Resolution::Started(handle),
                    Err(err) => Resolution::Failed(format!("cannot resolve {host}: {err:?}")),
                },
                Some(handle) => match socket.get_query_result(handle) {
                    Ok(addrs) => match addrs.iter().find_map(ipv4_of) {
                        Some(ip) => Resolution::Resolved(ip),
                        None => Resolution::Failed(format!("no IPv4 address for {host}")),
                    },
                    Err(GetQueryResultError::Pending) => Resolution::Pending,
                    Err(GetQueryResultError::Failed) => Resolution::Failed(format!("cannot resolve {host}")),
                },
            };
            match outcome {
                Resolution::Pending => {}
                Resolution::Started(handle) => {
                    trace!("dns query for {host} started");
                    self.conns[idx].phase = Phase::Resolving {
                        host,
                        port,
                        query: Some(handle),
                    };
                    activity = true;
                }
                Resolution::Resolved(ip) => {
                    debug!("resolved {host} to {ip}");
                    match self.dial(ip, port) {
                        Ok((socket, local_port)) => {
                            let conn = &mut self.conns[idx];
                            conn.phase = Phase::Connecting;
                            conn.socket = Some(socket);
                            conn.local_port = local_port;
                            conn.set_remote(SocketAddrV4::new(ip, port));
                        }
                        Err(err) => {
                            self.conns[idx].phase = Phase::Connecting;
                            self.conns[idx].fail(&err.to_string());
                        }
                    }
                    activity = true;
                }
                Resolution::Failed(message) => {
                    self.conns[idx].phase = Phase::Connecting;
                    self.conns[idx].fail(&message);
                    activity = true;
                }
            }
        }
        activity
    }

    fn service_listeners(&mut self) -> bool {
        let mut handoffs = Vec::new();
        for (idx, conn) in self.conns.iter_mut().enumerate() {
            if !conn.is_listening() || conn.close_now() {
                continue;
            }
            let port = conn.local_port;
            let id = conn.id();
            for slot in &mut conn.backlog {
                let socket = self.sockets.get_mut::<tcp::Socket>(*slot);
                if !matches!(socket.state(), tcp::State::Established | tcp::State::CloseWait) {
                    continue;
                }
                let remote = socket
                    .remote_endpoint()
                    .and_then(|ep| ipv4_of(&ep.addr).map(|ip| SocketAddrV4::new(ip, ep.port)));
                let mut replacement = tcp_socket();
                if let Err(err) = replacement.listen(port) {
                    warn!("conn {id} cannot re-arm listener on {port}: {err:?}");
                }
                let accepted = mem::replace(slot, self.sockets.add(replacement));
                handoffs.push((idx, accepted, remote));
            }
        }
        let activity = !handoffs.is_empty();
        for (listener, socket, remote) in handoffs {
            let (protocol, handler, port) = {
                let listener = &self.conns[listener];
                let protocol = match listener.protocol {
                    Protocol::HttpServer => Protocol::HttpServer,
                    _ => Protocol::Raw,
                };
                (protocol, listener.handler(), listener.local_port)
            };
            let id = self.allocate_id();
            let mut child = Conn::accepted(id, protocol, handler, socket, remote, port);
            debug!("conn {id} accepted from {remote:?} on port {port}");
            child.dispatch(Event::Open);
            child.dispatch(Event::Accept);
            self.conns.push(child);
        }
        activity
    }

    fn service_connections(&mut self) -> bool {
        let now = StdInstant::now();
        let mut scratch = [0u8; SCRATCH_LEN];
        let mut activity = false;
        for conn in &mut self.conns {
            let Some(handle) = conn.socket else {
                continue;
            };
            if conn.close_now() {
                continue;
            }
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);
            activity |= service_socket(conn, socket, now, &mut scratch);
        }
        activity
    }

    fn reap_closed(&mut self) -> bool {
        let mut reaped = false;
        let mut idx = 0;
        while idx < self.conns.len() {
            if !self.conns[idx].close_now() {
                idx += 1;
                continue;
            }
            let mut conn = self.conns.remove(idx);
            self.retire(&mut conn);
            reaped = true;
        }
        reaped
    }

    fn retire(&mut self, conn: &mut Conn) {
        for handle in conn.backlog.drain(..) {
            self.sockets.remove(handle);
        }
        if let Some(handle) = conn.socket.take() {
            if !conn.has_output() {
                conn.finish_tls();
            }
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);
            if !conn.wire_out.is_empty() && socket.can_send() {
                let _ = socket.send_slice(&conn.wire_out);
            }
            socket.close();
            self.lingering.push((handle, StdInstant::now()));
        }
        conn.dispatch(Event::Close);
        debug!("conn {} closed", conn.id());
    }

    fn reap_lingering(&mut self) {
        let now = StdInstant::now();
        let sockets = &mut self.sockets;
        self.lingering.retain(|&(handle, since)| {
            let state = sockets.get::<tcp::Socket>(handle).state();
            let finished = matches!(state, tcp::State::Closed | tcp::State::TimeWait);
            if finished || now.duration_since(since) >= LINGER {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }

    fn refresh_telemetry(&mut self) {
        let stats = self.phy.stats();
        self.telemetry = Telemetry {
            link_up: self.phy.link_up(),
            rx_frames: stats.rx_frames,
            tx_frames: stats.tx_frames,
            tx_drops: stats.tx_drops,
            last_poll_ms: self.clock.elapsed_ms(),
            polls: self.telemetry.polls + 1,
        };
    }
}

/// Pump one established or connecting socket.
fn service_socket(conn: &mut Conn, socket: &mut tcp::Socket<'static>, now: StdInstant, scratch: &mut [u8]) -> bool {
    let mut activity = false;
    if matches!(conn.phase, Phase::Connecting) {
        match socket.state() {
            tcp::State::SynSent | tcp::State::SynReceived => return false,
            tcp::State::Closed => {
                conn.fail("connection refused");
                return true;
            }
            _ => {
                debug!("conn {} connected", conn.id());
                conn.on_connected();
                activity = true;
            }
        }
    }

    while socket.can_recv() && !conn.close_now() {
        match socket.recv_slice(scratch) {
            Ok(0) => break,
            Ok(len) => {
                conn.ingest(&scratch[..len]);
                activity = true;
            }
            Err(err) => {
                warn!("conn {} recv failed: {err:?}", conn.id());
                break;
            }
        }
    }
    let peer_closed = !socket.may_recv();
    conn.process_inbound(peer_closed);
    conn.service_timers(now);
    conn.stage_output();

    while !conn.wire_out.is_empty() && socket.can_send() {
        match socket.send_slice(&conn.wire_out) {
            Ok(0) => break,
            Ok(len) => {
                conn.wire_out.drain(..len);
                activity = true;
            }
            Err(err) => {
                warn!("conn {} send failed: {err:?}", conn.id());
                break;
            }
        }
    }

    if conn.is_draining() && !conn.has_output() {
        conn.close();
    }
    if peer_closed && !conn.close_now() && (!conn.has_output() || !socket.is_open()) {
        debug!("conn {} closed by peer", conn.id());
        conn.close();
    }
    activity
}

fn tcp_socket() -> tcp::Socket<'static> {
    tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0; TCP_RX_BUFFER]),
        tcp::SocketBuffer::new(vec![0; TCP_TX_BUFFER]),
    )
}

/// The resolver list handed to smoltcp, which holds a single server by default.
fn resolvers(servers: &[Ipv4Addr]) -> Vec<IpAddress> {
    servers
        .iter()
        .take(1)
        .map(|&server| IpAddress::Ipv4(server.into()))
        .collect()
}

#[allow(unreachable_patterns)]
fn ipv4_of(addr: &IpAddress) -> Option<Ipv4Addr> {
    match addr {
        IpAddress::Ipv4(v4) => Some((*v4).into()),
        _ => None,
    }
}

fn apply_address(iface: &mut Interface, ip: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) {
    iface.update_ip_addrs(|addrs| {
        addrs.clear();
        if addrs.push(IpCidr::new(IpAddress::Ipv4(ip.into()), prefix_len)).is_err() {
            warn!("interface address table full, {ip} not installed");
        }
    });
    let _ = iface.routes_mut().remove_default_ipv4_route();
    if let Some(gateway) = gateway {
        if let Err(err) = iface.routes_mut().add_default_ipv4_route(gateway.into()) {
            warn!("default route via {gateway} not installed: {err:?}");
        }
    }
}
