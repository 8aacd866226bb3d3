// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error type shared by the tapcheck event manager and its codecs.
// Author: Lukas Bower

//! Errors surfaced by manager operations and connection actions.

use thiserror::Error;

use crate::http::HttpError;
use crate::mqtt::MqttError;
use crate::ws::WsError;

/// Errors surfaced by [`crate::Manager`] operations and [`crate::Conn`] actions.
#[derive(Debug, Error)]
pub enum StackError {
    /// URL could not be parsed into a connectable endpoint.
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl {
        /// URL as supplied by the caller.
        url: String,
        /// Reason the URL was rejected.
        reason: String,
    },
    /// URL scheme is not one the manager understands.
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    /// Hardware address text was not six colon separated octets.
    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
    /// Outbound connection could not be initiated.
    #[error("connect to {target} failed: {reason}")]
    Connect {
        /// Remote endpoint that was being dialled.
        target: String,
        /// Reason reported by the TCP layer.
        reason: String,
    },
    /// Listening socket could not be created.
    #[error("listen on port {port} failed: {reason}")]
    Listen {
        /// Requested port.
        port: u16,
        /// Reason reported by the TCP layer.
        reason: String,
    },
    /// Action requires a connection speaking a different protocol.
    #[error("connection is not speaking {0}")]
    WrongProtocol(&'static str),
    /// Request cannot be honoured because the connection is closing.
    #[error("connection is closing")]
    Closing,
    /// HTTP framing failure.
    #[error("http: {0}")]
    Http(#[from] HttpError),
    /// WebSocket framing failure.
    #[error("websocket: {0}")]
    Ws(#[from] WsError),
    /// MQTT framing failure.
    #[error("mqtt: {0}")]
    Mqtt(#[from] MqttError),
    /// TLS configuration or record layer failure.
    #[error("tls: {0}")]
    Tls(String),
    /// Secure transport requested on a build without the `tls` feature.
    #[error("secure transport requested but tls support is not compiled in")]
    TlsUnavailable,
    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
