// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Connection events and the handler contract invoked by the manager.
// Author: Lukas Bower

//! Events delivered to connection handlers.

use std::sync::{Arc, Mutex};

use crate::conn::Conn;
use crate::http::HttpMessage;
use crate::mqtt::MqttMessage;
use crate::ws::WsMessage;

/// Notification delivered to a connection's handler during a poll.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// Connection object created.
    Open,
    /// Inbound connection accepted by a listener.
    Accept,
    /// Outbound connection established.
    Connect,
    /// Raw bytes received on a connection with no protocol parser.
    Read(&'a [u8]),
    /// Complete HTTP request or response.
    HttpMsg(&'a HttpMessage),
    /// WebSocket upgrade completed; carries the upgrade request.
    WsOpen(&'a HttpMessage),
    /// Complete WebSocket data message.
    WsMsg(&'a WsMessage),
    /// MQTT session accepted by the broker.
    MqttOpen,
    /// MQTT PUBLISH received.
    MqttMsg(&'a MqttMessage),
    /// Failure on the connection; it will be closed.
    Error(&'a str),
    /// Connection finished; its identifier is no longer valid afterwards.
    Close,
}

impl Event<'_> {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Read(_) => "read",
            Self::HttpMsg(_) => "http-msg",
            Self::WsOpen(_) => "ws-open",
            Self::WsMsg(_) => "ws-msg",
            Self::MqttOpen => "mqtt-open",
            Self::MqttMsg(_) => "mqtt-msg",
            Self::Error(_) => "error",
            Self::Close => "close",
        }
    }
}

/// Receives events for one or more connections.
///
/// Listeners share their handler with every connection they accept. Any
/// `FnMut(&mut Conn, Event<'_>) + Send` closure is a handler.
pub trait EventHandler: Send {
    /// Handle `event` for `conn`.
    fn on_event(&mut self, conn: &mut Conn, event: Event<'_>);
}

impl<F> EventHandler for F
where
    F: FnMut(&mut Conn, Event<'_>) + Send,
{
    fn on_event(&mut self, conn: &mut Conn, event: Event<'_>) {
        self(conn, event);
    }
}

pub(crate) type SharedHandler = Arc<Mutex<dyn EventHandler>>;

pub(crate) fn share<H: EventHandler + 'static>(handler: H) -> SharedHandler {
    Arc::new(Mutex::new(handler))
}
