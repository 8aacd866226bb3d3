// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Event-driven user-space TCP/IP stack binding used by tapcheck.
// Author: Lukas Bower

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Event-driven networking on top of smoltcp.
//!
//! A [`Manager`] owns one Ethernet interface bound to a [`Driver`], keeps
//! its address (static or DHCP), and runs every connection. Callers drive it
//! with [`Manager::poll`] and observe connections through handler callbacks
//! receiving [`Event`]s. HTTP/1.x, WebSocket and MQTT 3.1.1 framing are
//! built in; TLS is available behind the `tls` feature.

mod clock;
pub mod conn;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod http;
pub mod manager;
pub mod mqtt;
pub mod netif;
pub mod serve;
pub mod tls;
pub mod ws;

pub use conn::{Conn, ConnId};
pub use driver::{Driver, DriverPhy, LinkDownDriver, LoopbackDriver, MAX_FRAME_LEN};
pub use error::StackError;
pub use event::{Event, EventHandler};
pub use http::HttpMessage;
pub use manager::{Manager, Telemetry};
pub use mqtt::{MqttMessage, MqttOpts};
pub use netif::{parse_mac, AddressMode, NetIf, NetIfConfig, StaticAddress};
pub use serve::ServeOpts;
pub use smoltcp::wire::EthernetAddress;
pub use tls::TlsOpts;
pub use ws::{WsMessage, WsOp, WsSession};
