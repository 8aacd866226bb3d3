// Author: Lukas Bower
// Purpose: Drive the harness scenarios against in-process peers over a loopback link.

mod support;

use std::fs;
use std::sync::mpsc;
use std::time::Duration;

use serial_test::serial;
use tapcheck::config::ScenarioKind;
use tapcheck::pacing::PollBudget;
use tapcheck::report;
use tapcheck::scenario::http_server::{self, ServerOpts, GREETING};
use tapcheck::scenario::{http_client, mqtt};
use tapcheck::setup::await_address;
use tapcheck::trust::TrustStore;
use tapcheck::{run_scenarios, HarnessConfig};
use tapcheck_stack::ws::{self, WsOp, WsSession};
use tapcheck_stack::{
    AddressMode, Driver, Event, LinkDownDriver, LoopbackDriver, Manager, NetIfConfig, ServeOpts, MAX_FRAME_LEN,
};

use support::{
    dhcp_request, linked, peer_config, pump, serving_peer, DhcpServer, HARNESS_IP, LEASE_IP, PEER_IP,
};

fn short_budget() -> PollBudget {
    PollBudget::new(20, Duration::from_millis(1))
}

fn isolated(cfg: &HarnessConfig) -> Manager {
    Manager::new(cfg.netif.clone(), Box::new(LinkDownDriver))
}

#[test]
#[serial]
fn static_address_is_ready_before_scenarios() {
    let (mut harness, _peer) = linked();
    let before = report::checks_run();
    let ip = await_address(&mut harness, short_budget());
    assert_eq!(ip, HARNESS_IP);
    assert!(report::checks_run() > before);
}

#[test]
#[serial]
fn static_setup_sends_no_dhcp() {
    let (a, mut far_end) = LoopbackDriver::pair();
    let mut harness = Manager::new(support::netif(HARNESS_IP), Box::new(a));
    await_address(&mut harness, short_budget());
    for _ in 0..10 {
        harness.poll(Duration::ZERO);
    }
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    let mut dhcp = Vec::new();
    loop {
        let len = far_end.receive(&mut buf);
        if len == 0 {
            break;
        }
        dhcp.extend(dhcp_request(&buf[..len]));
    }
    assert!(dhcp.is_empty(), "{dhcp:?}");
}

#[test]
#[serial]
fn dhcp_lease_is_awaited_before_scenarios() {
    let (a, far_end) = LoopbackDriver::pair();
    let server = DhcpServer::spawn(far_end);
    let config = NetIfConfig {
        address: AddressMode::Dhcp,
        ..support::netif(HARNESS_IP)
    };
    let mut harness = Manager::new(config, Box::new(a));
    assert!(!harness.netif().is_configured());
    let ip = await_address(&mut harness, PollBudget::new(500, Duration::from_millis(10)));
    assert_eq!(ip, LEASE_IP);
    assert_eq!(harness.netif().mask(), std::net::Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(harness.netif().gateway(), Some(PEER_IP));
    assert!(server.stop() >= 2);
}

#[test]
#[serial]
#[should_panic(expected = "FAILURE")]
fn missing_lease_fails_the_run() {
    let config = NetIfConfig {
        address: AddressMode::Dhcp,
        ..support::netif(HARNESS_IP)
    };
    let mut mgr = Manager::new(config, Box::new(LinkDownDriver));
    await_address(&mut mgr, short_budget());
}

#[test]
#[serial]
fn client_fetch_sees_redirect() {
    let (mut harness, peer) = linked();
    let peer = serving_peer(peer);
    let cfg = peer_config();
    let trust = TrustStore::new(".");
    let request = cfg.http_request().expect("request");
    assert_eq!(request, format!("GET /robots.txt HTTP/1.0\r\nHost: {PEER_IP}\r\n\r\n"));

    let outcome = http_client::fetch(&mut harness, &cfg.http_url, &request, &trust, cfg.budget).expect("fetch");
    assert!(outcome.closed);
    assert_eq!(outcome.status, 301);
    let text = String::from_utf8_lossy(&outcome.message).into_owned();
    assert!(text.starts_with("HTTP/1.1 301"), "{text}");
    assert!(text.contains("Location: https://10.0.0.2/robots.txt"));

    let before = report::checks_run();
    http_client::run(&mut harness, &cfg).expect("client scenario");
    assert!(report::checks_run() > before);
    drop(peer.stop());
}

#[test]
#[serial]
#[should_panic(expected = "FAILURE")]
fn client_fetch_without_link_times_out() {
    let mut cfg = peer_config();
    cfg.budget = short_budget();
    let mut mgr = isolated(&cfg);
    http_client::run(&mut mgr, &cfg).expect("client scenario");
}

#[test]
#[serial]
fn mqtt_round_trip_through_broker() {
    let (mut harness, peer) = linked();
    let peer = serving_peer(peer);
    let cfg = peer_config();
    let before = report::checks_run();
    mqtt::run(&mut harness, &cfg).expect("mqtt scenario");
    assert!(report::checks_run() >= before + 5);
    drop(peer.stop());
}

#[test]
#[serial]
#[should_panic(expected = "FAILURE")]
fn mqtt_without_link_times_out() {
    let mut cfg = peer_config();
    cfg.budget = short_budget();
    let mut mgr = isolated(&cfg);
    mqtt::run(&mut mgr, &cfg).expect("mqtt scenario");
}

fn server_manager(data: &std::path::Path) -> (Manager, Manager) {
    let (mut harness, peer) = linked();
    let opts = ServerOpts {
        serve: ServeOpts::new(data),
        tls: None,
    };
    harness
        .http_listen("http://0.0.0.0:12347", http_server::handler(opts))
        .expect("listen");
    (harness, peer)
}

fn request(harness: &mut Manager, peer: &mut Manager, raw: &str) -> (u16, String) {
    let (tx, rx) = mpsc::channel();
    let id = peer
        .http_connect(&format!("http://{HARNESS_IP}:12347"), move |c, event| {
            if let Event::HttpMsg(response) = event {
                tx.send((response.status().unwrap_or(0), response.body_text().into_owned()))
                    .expect("report response");
                c.close();
            }
        })
        .expect("connect");
    assert!(peer.conn_mut(id).expect("client").send(raw.as_bytes()));
    let mut response = None;
    assert!(pump(harness, peer, |_, _| {
        if let Ok(got) = rx.try_recv() {
            response = Some(got);
        }
        response.is_some()
    }));
    response.expect("response")
}

#[test]
fn server_routes_answer_requests() {
    let data = tempfile::tempdir().expect("tempdir");
    fs::write(data.path().join("index.html"), "<h1>tapcheck</h1>").expect("index");
    let (mut harness, mut peer) = server_manager(data.path());

    let (status, body) = request(&mut harness, &mut peer, "GET /foo/bar HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!((status, body.as_str()), (200, "bar"));

    let (status, _) = request(&mut harness, &mut peer, "GET /foo/bar/baz HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(status, 404);

    let (status, body) = request(
        &mut harness,
        &mut peer,
        "POST /body HTTP/1.1\r\nHost: t\r\nContent-Length: 11\r\n\r\nhello world",
    );
    assert_eq!((status, body.as_str()), (200, "hello world"));

    let (status, body) = request(
        &mut harness,
        &mut peer,
        "POST /body HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
    );
    assert_eq!((status, body.as_str()), (200, "hello world"));

    let (status, body) = request(&mut harness, &mut peer, "GET / HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(status, 200);
    assert_eq!(body, "<h1>tapcheck</h1>");

    let (status, _) = request(&mut harness, &mut peer, "GET /missing.txt HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(status, 404);
}

#[test]
fn server_websocket_greets_then_echoes_with_same_opcode() {
    let data = tempfile::tempdir().expect("tempdir");
    let (mut harness, mut peer) = server_manager(data.path());

    let (tx, rx) = mpsc::channel();
    let key = ws::client_key();
    let upgrade = ws::upgrade_request(&HARNESS_IP.to_string(), "/ws", &key);
    let id = peer
        .connect(&format!("tcp://{HARNESS_IP}:12347"), move |c, event| match event {
            Event::Connect => {
                c.send(&upgrade);
            }
            Event::Read(data) => tx.send(data.to_vec()).expect("report bytes"),
            _ => {}
        })
        .expect("connect");

    let mut inbound = Vec::new();
    let mut upgraded = false;
    let mut session = WsSession::client();
    let mut greeting = None;
    assert!(pump(&mut harness, &mut peer, |_, _| {
        inbound.extend(rx.try_iter().flatten());
        if !upgraded {
            if let Some(end) = inbound.windows(4).position(|w| w == b"\r\n\r\n") {
                assert!(inbound.starts_with(b"HTTP/1.1 101"));
                inbound.drain(..end + 4);
                upgraded = true;
            }
        }
        if upgraded {
            session.feed(&inbound);
            inbound.clear();
            greeting = greeting.take().or_else(|| session.read().ok().flatten());
        }
        greeting.is_some()
    }));
    let greeting = greeting.expect("greeting");
    assert_eq!(greeting.op, WsOp::Binary);
    assert_eq!(greeting.data, GREETING);

    session.send(WsOp::Text, b"text frame").expect("text");
    session.send(WsOp::Binary, &[0, 1, 2, 254]).expect("binary");
    assert!(peer.conn_mut(id).expect("ws client").send(&session.take_output()));

    let mut echoed = Vec::new();
    assert!(pump(&mut harness, &mut peer, |_, _| {
        for chunk in rx.try_iter() {
            session.feed(&chunk);
        }
        while let Ok(Some(message)) = session.read() {
            echoed.push(message);
        }
        echoed.len() >= 2
    }));
    assert_eq!((echoed[0].op, echoed[0].data.as_slice()), (WsOp::Text, &b"text frame"[..]));
    assert_eq!((echoed[1].op, echoed[1].data.as_slice()), (WsOp::Binary, &[0u8, 1, 2, 254][..]));
}

#[test]
#[serial]
fn server_scenario_runs_client_command() {
    let data = tempfile::tempdir().expect("tempdir");
    let (mut harness, _peer) = linked();
    let mut cfg = peer_config();
    cfg.data_dir = data.path().to_path_buf();
    cfg.client_cmd = "test {scheme} = http && test {port} = 12347 && test {ip} = 10.0.0.1".into();
    cfg.budget = PollBudget::new(200, Duration::from_millis(1));

    http_server::run(&mut harness, &cfg, HARNESS_IP).expect("server scenario");
    harness.poll(Duration::ZERO);
    assert_eq!(harness.connection_count(), 0);
    assert!(harness.telemetry().polls > 0);
}

#[test]
#[serial]
#[should_panic(expected = "FAILURE")]
fn failing_client_command_fails_the_run() {
    let data = tempfile::tempdir().expect("tempdir");
    let (mut harness, _peer) = linked();
    let mut cfg = peer_config();
    cfg.data_dir = data.path().to_path_buf();
    cfg.client_cmd = "exit 3".into();
    cfg.budget = PollBudget::new(50, Duration::from_millis(1));
    http_server::run(&mut harness, &cfg, HARNESS_IP).expect("server scenario");
}

#[test]
#[serial]
fn full_run_then_teardown_leaves_no_connections() {
    let (mut harness, peer) = linked();
    let peer = serving_peer(peer);
    let mut cfg = peer_config();
    cfg.scenarios = vec![ScenarioKind::HttpClient, ScenarioKind::Mqtt];

    let before = report::checks_run();
    run_scenarios(&mut harness, &cfg).expect("scenarios");
    assert!(report::checks_run() > before);
    assert!(report::summary().starts_with("SUCCESS. Total tests: "));

    harness.free();
    assert_eq!(harness.connection_count(), 0);
    harness.free();
    assert_eq!(harness.connection_count(), 0);
    drop(harness.release_interface());
    drop(peer.stop());
}

#[cfg(feature = "tls")]
mod tls {
    use super::*;

    fn write_identity(root: &std::path::Path) {
        let certified = rcgen::generate_simple_self_signed(vec![PEER_IP.to_string()]).expect("cert");
        let cert = certified.cert.pem();
        let key = certified.key_pair.serialize_pem();
        fs::create_dir_all(root.join("certs")).expect("certs dir");
        fs::create_dir_all(root.join("data")).expect("data dir");
        fs::write(root.join("certs/server.crt"), &cert).expect("cert");
        fs::write(root.join("certs/server.key"), &key).expect("key");
        fs::write(root.join("data/ca.pem"), &cert).expect("ca");
    }

    #[test]
    #[serial]
    fn https_fetch_verifies_peer_identity() {
        let trust_dir = tempfile::tempdir().expect("tempdir");
        write_identity(trust_dir.path());
        let trust = TrustStore::new(trust_dir.path());
        let server_tls = http_server::server_tls(&trust).expect("server identity");

        let (mut harness, mut peer) = linked();
        peer.http_listen("https://0.0.0.0:8443", move |c, event| match event {
            Event::Accept => c.tls_init(&server_tls).expect("server tls"),
            other => support::redirecting_site(c, other),
        })
        .expect("https listen");
        let peer = support::Peer::spawn(peer);

        let url = format!("https://{PEER_IP}:8443");
        let request = format!("GET /robots.txt HTTP/1.0\r\nHost: {PEER_IP}\r\n\r\n");
        let outcome = http_client::fetch(&mut harness, &url, &request, &trust, PollBudget::new(2000, Duration::from_millis(2)))
            .expect("fetch");
        assert_eq!(outcome.status, 301);
        drop(peer.stop());
    }
}
