// Author: Lukas Bower
// Purpose: In-process peers for harness scenario tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tapcheck::config::HarnessConfig;
use tapcheck::PollBudget;
use tapcheck_stack::mqtt::{self, Packet, Publish};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    DhcpMessageType, DhcpPacket, DhcpRepr, EthernetFrame, EthernetProtocol, EthernetRepr, IpAddress, IpProtocol,
    Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use tapcheck_stack::{
    AddressMode, Conn, ConnId, Driver, EthernetAddress, Event, LoopbackDriver, Manager, NetIfConfig, StaticAddress,
    MAX_FRAME_LEN,
};

pub const HARNESS_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const HTTP_PORT: u16 = 8080;
pub const BROKER_PORT: u16 = 1883;
pub const LEASE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 77);
pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x67]);

pub fn netif(ip: Ipv4Addr) -> NetIfConfig {
    let last = ip.octets()[3];
    NetIfConfig {
        mac: EthernetAddress([0x02, 0, 0, 0, 0, last]),
        address: AddressMode::Static(StaticAddress {
            ip,
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            dns: Vec::new(),
        }),
    }
}

/// Harness and peer managers joined by a loopback link.
pub fn linked() -> (Manager, Manager) {
    let (a, b) = LoopbackDriver::pair();
    (
        Manager::new(netif(HARNESS_IP), Box::new(a)),
        Manager::new(netif(PEER_IP), Box::new(b)),
    )
}

/// Configuration pointing every remote endpoint at the peer.
pub fn peer_config() -> HarnessConfig {
    let mut cfg = HarnessConfig::default();
    cfg.netif = netif(HARNESS_IP);
    cfg.http_url = format!("http://{PEER_IP}:{HTTP_PORT}");
    cfg.mqtt_url = format!("mqtt://{PEER_IP}:{BROKER_PORT}");
    cfg.expect_status = 301;
    cfg.budget = PollBudget::new(1500, Duration::from_millis(2));
    cfg
}

/// Poll both managers from the test thread until `done` holds.
pub fn pump(a: &mut Manager, b: &mut Manager, mut done: impl FnMut(&Manager, &Manager) -> bool) -> bool {
    for _ in 0..3000 {
        if done(a, b) {
            return true;
        }
        a.poll(Duration::ZERO);
        b.poll(Duration::ZERO);
        thread::sleep(Duration::from_millis(1));
    }
    done(a, b)
}

/// A manager polled on its own thread until stopped.
pub struct Peer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Manager>>,
}

impl Peer {
    pub fn spawn(mut mgr: Manager) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                mgr.poll(Duration::ZERO);
                thread::sleep(Duration::from_millis(1));
            }
            mgr
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) -> Manager {
        self.stop.store(true, Ordering::Release);
        self.thread
            .take()
            .expect("peer thread")
            .join()
            .expect("peer thread panicked")
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// HTTP endpoint answering `/robots.txt` with a permanent redirect.
pub fn redirecting_site(conn: &mut Conn, event: Event<'_>) {
    if let Event::HttpMsg(request) = event {
        if request.uri == "/robots.txt" {
            conn.http_reply(301, &format!("Location: https://{PEER_IP}/robots.txt\r\n"), "");
        } else {
            conn.http_reply(404, "", "not found\n");
        }
        conn.drain();
    }
}

/// Minimal MQTT 3.1.1 broker over raw TCP: accepts every client, grants
/// every subscription and delivers publishes to subscribed connections.
pub fn broker() -> impl FnMut(&mut Conn, Event<'_>) + Send + 'static {
    let mut inbound: HashMap<ConnId, Vec<u8>> = HashMap::new();
    let mut subscriptions: HashMap<ConnId, Vec<String>> = HashMap::new();
    let mut next_id: u16 = 0;
    move |conn, event| match event {
        Event::Read(data) => {
            let buf = inbound.entry(conn.id()).or_default();
            buf.extend_from_slice(data);
            while let Ok(Some((packet, used))) = mqtt::decode(buf) {
                buf.drain(..used);
                let mut replies = Vec::new();
                match packet {
                    Packet::Connect(_) => replies.push(Packet::ConnAck {
                        session_present: false,
                        code: 0,
                    }),
                    Packet::Subscribe { id, topics } => {
                        let codes = topics.iter().map(|(_, qos)| *qos).collect();
                        subscriptions
                            .entry(conn.id())
                            .or_default()
                            .extend(topics.into_iter().map(|(topic, _)| topic));
                        replies.push(Packet::SubAck { id, codes });
                    }
                    Packet::Unsubscribe { id, topics } => {
                        if let Some(subs) = subscriptions.get_mut(&conn.id()) {
                            subs.retain(|topic| !topics.contains(topic));
                        }
                        replies.push(Packet::UnsubAck { id });
                    }
                    Packet::Publish(publish) => {
                        if publish.qos > 0 {
                            replies.push(Packet::PubAck { id: publish.id });
                        }
                        let subscribed = subscriptions
                            .get(&conn.id())
                            .is_some_and(|subs| subs.contains(&publish.topic));
                        if subscribed {
                            next_id = next_id.wrapping_add(1).max(1);
                            replies.push(Packet::Publish(Publish { id: next_id, ..publish }));
                        }
                    }
                    Packet::PingReq => replies.push(Packet::PingResp),
                    Packet::Disconnect => conn.close(),
                    _ => {}
                }
                for reply in replies {
                    conn.send(&reply.encode().expect("encode broker reply"));
                }
            }
        }
        Event::Close => {
            inbound.remove(&conn.id());
            subscriptions.remove(&conn.id());
        }
        _ => {}
    }
}

/// Peer serving the redirecting site and the broker.
pub fn serving_peer(mut peer: Manager) -> Peer {
    peer.http_listen(&format!("http://0.0.0.0:{HTTP_PORT}"), redirecting_site)
        .expect("http listen");
    peer.listen(&format!("tcp://0.0.0.0:{BROKER_PORT}"), broker())
        .expect("broker listen");
    Peer::spawn(peer)
}

/// Client message pulled out of a DHCP frame sent to the server port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpRequest {
    pub kind: DhcpMessageType,
    pub xid: u32,
    pub mac: EthernetAddress,
}

/// Decode `frame` as a DHCP client message, if it is one.
pub fn dhcp_request(frame: &[u8]) -> Option<DhcpRequest> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    if udp.dst_port() != DHCP_SERVER_PORT {
        return None;
    }
    let dhcp = DhcpPacket::new_checked(udp.payload()).ok()?;
    let repr = DhcpRepr::parse(&dhcp).ok()?;
    Some(DhcpRequest {
        kind: repr.message_type,
        xid: repr.transaction_id,
        mac: repr.client_hardware_address,
    })
}

/// OFFER or ACK granting [`LEASE_IP`] with the peer as router and server.
fn dhcp_reply(request: DhcpRequest, kind: DhcpMessageType) -> Vec<u8> {
    let server = Ipv4Address::from(PEER_IP);
    let reply = DhcpRepr {
        message_type: kind,
        transaction_id: request.xid,
        secs: 0,
        client_hardware_address: request.mac,
        client_ip: Ipv4Address::UNSPECIFIED,
        your_ip: Ipv4Address::from(LEASE_IP),
        server_ip: server,
        router: Some(server),
        subnet_mask: Some(Ipv4Address::new(255, 255, 255, 0)),
        relay_agent_ip: Ipv4Address::UNSPECIFIED,
        broadcast: false,
        requested_ip: None,
        client_identifier: None,
        server_identifier: Some(server),
        parameter_request_list: None,
        dns_servers: None,
        max_size: None,
        lease_duration: Some(3600),
        renew_duration: None,
        rebind_duration: None,
        additional_options: &[],
    };
    let caps = ChecksumCapabilities::default();
    let udp_repr = UdpRepr {
        src_port: DHCP_SERVER_PORT,
        dst_port: DHCP_CLIENT_PORT,
    };
    let dhcp_len = reply.buffer_len();
    let ip_repr = Ipv4Repr {
        src_addr: server,
        dst_addr: Ipv4Address::BROADCAST,
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + dhcp_len,
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: DHCP_SERVER_MAC,
        dst_addr: request.mac,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut frame = vec![0u8; eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len];
    let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &caps);
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &IpAddress::Ipv4(server),
        &IpAddress::Ipv4(Ipv4Address::BROADCAST),
        dhcp_len,
        |payload| {
            let mut packet = DhcpPacket::new_unchecked(payload);
            reply.emit(&mut packet).expect("emit dhcp reply");
        },
        &caps,
    );
    frame
}

/// Scripted DHCP server on the far end of a loopback link: answers
/// DISCOVER with OFFER and REQUEST with ACK for [`LEASE_IP`].
pub struct DhcpServer {
    stop: Arc<AtomicBool>,
    replies: Arc<AtomicUsize>,
    thread: Option<JoinHandle<LoopbackDriver>>,
}

impl DhcpServer {
    pub fn spawn(mut link: LoopbackDriver) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let replies = Arc::new(AtomicUsize::new(0));
        let (flag, sent) = (Arc::clone(&stop), Arc::clone(&replies));
        let thread = thread::spawn(move || {
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            while !flag.load(Ordering::Acquire) {
                let len = link.receive(&mut buf);
                if len == 0 {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                let Some(request) = dhcp_request(&buf[..len]) else {
                    continue;
                };
                let kind = match request.kind {
                    DhcpMessageType::Discover => DhcpMessageType::Offer,
                    DhcpMessageType::Request => DhcpMessageType::Ack,
                    _ => continue,
                };
                link.transmit(&dhcp_reply(request, kind));
                sent.fetch_add(1, Ordering::SeqCst);
            }
            link
        });
        Self {
            stop,
            replies,
            thread: Some(thread),
        }
    }

    /// Stop serving and report how many replies were sent.
    pub fn stop(mut self) -> usize {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.join().expect("dhcp server panicked");
        }
        self.replies.load(Ordering::SeqCst)
    }
}

impl Drop for DhcpServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
