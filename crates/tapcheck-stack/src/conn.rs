// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Connection state, handler actions and per-protocol inbound processing.
// Author: Lukas Bower

//! Connections owned by a [`crate::Manager`].
//!
//! Handlers receive `&mut Conn` and act on it: queue bytes, reply to HTTP,
//! upgrade to WebSocket, drive an MQTT session or request closure. Actions
//! only touch the connection's buffers; the manager moves bytes to and from
//! the TCP socket on its next poll.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::net::SocketAddrV4;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use smoltcp::iface::SocketHandle;
use smoltcp::socket::dns::QueryHandle;

use crate::error::StackError;
use crate::event::{Event, SharedHandler};
use crate::http::{self, HttpMessage};
use crate::mqtt::{self, MqttMessage, MqttOpts, Packet, Publish, Session};
use crate::serve::{self, ServeOpts};
use crate::tls::{self, Tls, TlsOpts};
use crate::ws::{self, WsError, WsOp, WsSession};

/// Stable identifier of a connection within its manager.
///
/// Identifiers are never reused, so a lookup after [`Event::Close`] yields
/// `None` rather than a different connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum Protocol {
    Raw,
    HttpServer,
    HttpClient,
    WebSocket(WsSession),
    Mqtt(Session),
}

impl Protocol {
    fn name(&self) -> &'static str {
        match self {
            Self::Raw => "tcp",
            Self::HttpServer | Self::HttpClient => "http",
            Self::WebSocket(_) => "websocket",
            Self::Mqtt(_) => "mqtt",
        }
    }
}

pub(crate) enum Phase {
    Resolving {
        host: String,
        port: u16,
        query: Option<QueryHandle>,
    },
    Connecting,
    Established,
    Listening,
}

// QueryHandle has no Debug impl; only whether a query is in flight is shown.
impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolving { host, port, query } => f
                .debug_struct("Resolving")
                .field("host", host)
                .field("port", port)
                .field("query_pending", &query.is_some())
                .finish(),
            Self::Connecting => f.write_str("Connecting"),
            Self::Established => f.write_str("Established"),
            Self::Listening => f.write_str("Listening"),
        }
    }
}

enum Pending {
    WsOpen(HttpMessage),
}

/// One connection: client, listener or accepted peer.
pub struct Conn {
    id: ConnId,
    pub(crate) phase: Phase,
    pub(crate) protocol: Protocol,
    pub(crate) socket: Option<SocketHandle>,
    pub(crate) backlog: Vec<SocketHandle>,
    pub(crate) local_port: u16,
    pub(crate) wants_tls: bool,
    handler: SharedHandler,
    remote: Option<SocketAddrV4>,
    accepted: bool,
    closing: bool,
    draining: bool,
    recv: Vec<u8>,
    send: Vec<u8>,
    pub(crate) wire_out: Vec<u8>,
    tls: Option<Tls>,
    pending: VecDeque<Pending>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("protocol", &self.protocol.name())
            .field("remote", &self.remote)
            .field("closing", &self.closing)
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(id: ConnId, protocol: Protocol, phase: Phase, handler: SharedHandler) -> Self {
        Self {
            id,
            phase,
            protocol,
            socket: None,
            backlog: Vec::new(),
            local_port: 0,
            wants_tls: false,
            handler,
            remote: None,
            accepted: false,
            closing: false,
            draining: false,
            recv: Vec::new(),
            send: Vec::new(),
            wire_out: Vec::new(),
            tls: None,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn accepted(
        id: ConnId,
        protocol: Protocol,
        handler: SharedHandler,
        socket: SocketHandle,
        remote: Option<SocketAddrV4>,
        local_port: u16,
    ) -> Self {
        let mut conn = Self::new(id, protocol, Phase::Established, handler);
        conn.socket = Some(socket);
        conn.remote = remote;
        conn.local_port = local_port;
        conn.accepted = true;
        conn
    }

    pub(crate) fn handler(&self) -> SharedHandler {
        Arc::clone(&self.handler)
    }

    pub(crate) fn set_remote(&mut self, remote: SocketAddrV4) {
        self.remote = Some(remote);
    }

    // ----- queries -------------------------------------------------------

    /// Identifier of this connection.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Peer address once known.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    /// Local TCP port.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether this is a listening connection.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        matches!(self.phase, Phase::Listening)
    }

    /// Whether this connection was accepted by a listener.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Whether the TCP handshake has completed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    /// Whether closure has been requested, immediately or after draining.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing || self.draining
    }

    /// Whether a TLS session is attached.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub(crate) fn close_now(&self) -> bool {
        self.closing
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining
    }

    // ----- actions -------------------------------------------------------

    /// Queue raw bytes for transmission; refused once closing.
    pub fn send(&mut self, data: &[u8]) -> bool {
        if self.is_closing() {
            warn!("conn {} dropped {} bytes queued while closing", self.id, data.len());
            return false;
        }
        self.send.extend_from_slice(data);
        true
    }

    /// Close immediately; queued data may be discarded.
    pub fn close(&mut self) {
        self.closing = true;
    }

    /// Close once all queued data has been transmitted.
    pub fn drain(&mut self) {
        self.draining = true;
    }

    /// Queue an HTTP/1.1 response with `Content-Length` set from `body`.
    pub fn http_reply(&mut self, status: u16, headers: &str, body: impl AsRef<[u8]>) {
        let reply = http::render_reply(status, headers, body.as_ref());
        self.send(&reply);
    }

    /// Answer `request` with a file or listing from the directory in `opts`.
    pub fn serve_dir(&mut self, request: &HttpMessage, opts: &ServeOpts) {
        let reply = serve::respond(request, opts);
        self.send(&reply);
    }

    /// Complete a WebSocket upgrade for `request`.
    ///
    /// [`Event::WsOpen`] follows as soon as the current handler returns. A
    /// request without `Sec-WebSocket-Key` is answered with 426.
    pub fn ws_upgrade(&mut self, request: &HttpMessage) -> Result<(), StackError> {
        if !matches!(self.protocol, Protocol::HttpServer) {
            return Err(StackError::WrongProtocol("http"));
        }
        let Some(key) = request.header("Sec-WebSocket-Key") else {
            self.http_reply(426, "", "Sec-WebSocket-Key is missing\n");
            return Err(StackError::Http(http::HttpError::Malformed(
                "missing Sec-WebSocket-Key".into(),
            )));
        };
        let response = ws::upgrade_response(key);
        self.send(&response);
        self.protocol = Protocol::WebSocket(WsSession::server());
        self.pending.push_back(Pending::WsOpen(request.clone()));
        Ok(())
    }

    /// Send one WebSocket frame, returning the encoded frame length.
    ///
    /// Returns 0 when the connection is not an upgraded WebSocket or is closing.
    pub fn ws_send(&mut self, data: &[u8], op: WsOp) -> usize {
        let Protocol::WebSocket(session) = &mut self.protocol else {
            warn!("conn {} ws_send before a websocket upgrade", self.id);
            return 0;
        };
        if let Err(err) = session.send(op, data) {
            warn!("conn {} websocket send failed: {err}", self.id);
            return 0;
        }
        let frame = session.take_output();
        if self.send(&frame) {
            frame.len()
        } else {
            0
        }
    }

    fn mqtt_session(&mut self) -> Result<&mut Session, StackError> {
        match &mut self.protocol {
            Protocol::Mqtt(session) => Ok(session),
            _ => Err(StackError::WrongProtocol("mqtt")),
        }
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), StackError> {
        let bytes = packet.encode()?;
        if !self.send(&bytes) {
            return Err(StackError::Closing);
        }
        self.mqtt_session()?.last_tx = Instant::now();
        Ok(())
    }

    fn checked_qos(qos: u8) -> Result<u8, StackError> {
        if qos > 1 {
            return Err(mqtt::MqttError::InvalidQos(qos).into());
        }
        Ok(qos)
    }

    /// Subscribe to `opts.topic` at `opts.qos`, returning the packet id.
    pub fn mqtt_sub(&mut self, opts: &MqttOpts) -> Result<u16, StackError> {
        let qos = Self::checked_qos(opts.qos)?;
        let id = self.mqtt_session()?.next_id();
        self.send_packet(&Packet::Subscribe {
            id,
            topics: vec![(opts.topic.clone(), qos)],
        })?;
        debug!("conn {} subscribe {} qos {qos} id {id}", self.id, opts.topic);
        Ok(id)
    }

    /// Unsubscribe from `topic`, returning the packet id.
    pub fn mqtt_unsub(&mut self, topic: &str) -> Result<u16, StackError> {
        let id = self.mqtt_session()?.next_id();
        self.send_packet(&Packet::Unsubscribe {
            id,
            topics: vec![topic.to_owned()],
        })?;
        Ok(id)
    }

    /// Publish `opts.message` to `opts.topic`, returning the packet id (0 for QoS 0).
    pub fn mqtt_pub(&mut self, opts: &MqttOpts) -> Result<u16, StackError> {
        let qos = Self::checked_qos(opts.qos)?;
        let id = if qos > 0 {
            self.mqtt_session()?.next_id()
        } else {
            self.mqtt_session()?;
            0
        };
        self.send_packet(&Packet::Publish(Publish {
            topic: opts.topic.clone(),
            payload: opts.message.clone(),
            qos,
            retain: opts.retain,
            dup: false,
            id,
        }))?;
        debug!(
            "conn {} publish {} ({} bytes) qos {qos} id {id}",
            self.id,
            opts.topic,
            opts.message.len()
        );
        Ok(id)
    }

    /// Send PINGREQ.
    pub fn mqtt_ping(&mut self) -> Result<(), StackError> {
        self.send_packet(&Packet::PingReq)
    }

    /// Send DISCONNECT and close once it has been written.
    pub fn mqtt_disconnect(&mut self) -> Result<(), StackError> {
        self.send_packet(&Packet::Disconnect)?;
        self.drain();
        Ok(())
    }

    /// Attach a TLS session; accepted connections act as the server side.
    pub fn tls_init(&mut self, opts: &TlsOpts) -> Result<(), StackError> {
        let session = tls::session(opts, self.accepted)?;
        self.tls = Some(session);
        debug!("conn {} tls session attached", self.id);
        Ok(())
    }

    // ----- manager side ---------------------------------------------------

    /// Deliver `event` and then any events queued by the handler's actions.
    pub(crate) fn dispatch(&mut self, event: Event<'_>) {
        self.deliver(event);
        while let Some(pending) = self.pending.pop_front() {
            match pending {
                Pending::WsOpen(request) => self.deliver(Event::WsOpen(&request)),
            }
        }
    }

    fn deliver(&mut self, event: Event<'_>) {
        trace!("conn {} event {}", self.id, event.name());
        let handler = Arc::clone(&self.handler);
        let mut guard = handler.lock().unwrap_or_else(PoisonError::into_inner);
        guard.on_event(self, event);
    }

    /// Report `message` to the handler and close.
    pub(crate) fn fail(&mut self, message: &str) {
        error!("conn {} {message}", self.id);
        self.dispatch(Event::Error(message));
        self.closing = true;
    }

    /// Transport is up: send any protocol preamble, then report the connect.
    pub(crate) fn on_connected(&mut self) {
        self.phase = Phase::Established;
        if self.wants_tls && self.tls.is_none() {
            self.fail("secure url connected without a tls session");
            return;
        }
        let connect = match &mut self.protocol {
            Protocol::Mqtt(session) => session.connect.take(),
            _ => None,
        };
        if let Some(packet) = connect {
            if let Err(err) = self.send_packet(&packet) {
                self.fail(&format!("mqtt connect failed: {err}"));
                return;
            }
        }
        self.dispatch(Event::Connect);
    }

    /// Accept bytes read from the socket.
    pub(crate) fn ingest(&mut self, wire: &[u8]) {
        let result = match self.tls.as_mut() {
            Some(session) => session.read_wire(wire, &mut self.recv),
            None => {
                self.recv.extend_from_slice(wire);
                Ok(())
            }
        };
        if let Err(err) = result {
            self.fail(&err.to_string());
        }
    }

    /// Move queued plaintext into the wire buffer, encrypting when needed.
    pub(crate) fn stage_output(&mut self) {
        let result = match self.tls.as_mut() {
            Some(session) => {
                let mut staged = Ok(());
                if !self.send.is_empty() {
                    staged = session.write_plain(&self.send);
                    self.send.clear();
                }
                staged.and_then(|()| session.write_wire(&mut self.wire_out))
            }
            None => {
                self.wire_out.append(&mut self.send);
                Ok(())
            }
        };
        if let Err(err) = result {
            self.fail(&err.to_string());
        }
    }

    /// Whether bytes are still waiting to reach the socket.
    pub(crate) fn has_output(&self) -> bool {
        !self.send.is_empty() || !self.wire_out.is_empty()
    }

    /// Queue a TLS close_notify ahead of shutdown.
    pub(crate) fn finish_tls(&mut self) {
        if let Some(session) = self.tls.as_mut() {
            session.close_notify();
            if session.write_wire(&mut self.wire_out).is_err() {
                self.wire_out.clear();
            }
        }
    }

    /// Send a keepalive ping when the MQTT session has been idle too long.
    pub(crate) fn service_timers(&mut self, now: Instant) {
        if !matches!(self.phase, Phase::Established) || self.is_closing() {
            return;
        }
        let due = match &self.protocol {
            Protocol::Mqtt(session) if session.keepalive > 0 && session.connect.is_none() => {
                now.duration_since(session.last_tx) >= Duration::from_secs(u64::from(session.keepalive))
            }
            _ => false,
        };
        if due {
            trace!("conn {} mqtt keepalive", self.id);
            if let Err(err) = self.mqtt_ping() {
                warn!("conn {} keepalive failed: {err}", self.id);
            }
        }
    }

    /// Parse and dispatch everything complete in the receive buffer.
    pub(crate) fn process_inbound(&mut self, peer_closed: bool) {
        while !self.closing {
            let progressed = match self.protocol {
                Protocol::Raw => self.process_raw(),
                Protocol::HttpServer => self.process_http_request(),
                Protocol::HttpClient => self.process_http_response(peer_closed),
                Protocol::WebSocket(_) => self.process_ws(),
                Protocol::Mqtt(_) => self.process_mqtt(),
            };
            if !progressed {
                break;
            }
        }
    }

    fn process_raw(&mut self) -> bool {
        if self.recv.is_empty() {
            return false;
        }
        let data = mem::take(&mut self.recv);
        self.dispatch(Event::Read(&data));
        true
    }

    fn process_http_request(&mut self) -> bool {
        match http::parse_request(&self.recv) {
            Ok(Some((request, used))) => {
                self.recv.drain(..used);
                self.dispatch(Event::HttpMsg(&request));
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("conn {} bad request: {err}", self.id);
                self.recv.clear();
                self.http_reply(400, "", format!("{err}\n"));
                self.drain();
                false
            }
        }
    }

    fn process_http_response(&mut self, peer_closed: bool) -> bool {
        if self.recv.is_empty() {
            return false;
        }
        match http::parse_response(&self.recv, peer_closed) {
            Ok(Some((response, used))) => {
                self.recv.drain(..used);
                self.dispatch(Event::HttpMsg(&response));
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.recv.clear();
                self.fail(&format!("bad response: {err}"));
                false
            }
        }
    }

    fn process_ws(&mut self) -> bool {
        let Protocol::WebSocket(session) = &mut self.protocol else {
            return false;
        };
        if !self.recv.is_empty() {
            session.feed(&self.recv);
            self.recv.clear();
        }
        let next = session.read();
        let replies = session.take_output();
        self.send.extend_from_slice(&replies);
        match next {
            Ok(Some(message)) => match message.op {
                WsOp::Text | WsOp::Binary => {
                    self.dispatch(Event::WsMsg(&message));
                    true
                }
                WsOp::Close => {
                    debug!("conn {} websocket closed by peer", self.id);
                    self.drain();
                    false
                }
                _ => true,
            },
            Ok(None) => false,
            Err(WsError::Closed) => {
                self.drain();
                false
            }
            Err(err) => {
                self.fail(&format!("websocket: {err}"));
                false
            }
        }
    }

    fn process_mqtt(&mut self) -> bool {
        let (packet, used) = match mqtt::decode(&self.recv) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return false,
            Err(err) => {
                self.recv.clear();
                self.fail(&format!("mqtt: {err}"));
                return false;
            }
        };
        self.recv.drain(..used);
        match packet {
            Packet::ConnAck { code: 0, .. } => {
                debug!("conn {} mqtt session open", self.id);
                self.dispatch(Event::MqttOpen);
            }
            Packet::ConnAck { code, .. } => {
                self.fail(&format!("mqtt connection refused, code {code}"));
                return false;
            }
            Packet::Publish(publish) => {
                if publish.qos == 1 {
                    if let Err(err) = self.send_packet(&Packet::PubAck { id: publish.id }) {
                        warn!("conn {} puback failed: {err}", self.id);
                    }
                }
                let message = MqttMessage {
                    topic: publish.topic,
                    data: publish.payload,
                    qos: publish.qos,
                    id: publish.id,
                    retain: publish.retain,
                    dup: publish.dup,
                };
                self.dispatch(Event::MqttMsg(&message));
            }
            Packet::PubAck { id } => debug!("conn {} puback {id}", self.id),
            Packet::SubAck { id, codes } => debug!("conn {} suback {id} {codes:?}", self.id),
            Packet::UnsubAck { id } => debug!("conn {} unsuback {id}", self.id),
            Packet::PingResp => trace!("conn {} pingresp", self.id),
            other => warn!("conn {} unexpected mqtt packet {other:?}", self.id),
        }
        true
    }
}
