// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: WebSocket handshake helpers and sessions over the connection buffers.
// Author: Lukas Bower

//! WebSocket sessions (RFC 6455) driven through in-memory buffers.
//!
//! Framing, masking rules and fragment reassembly come from `tungstenite`.
//! A [`WsSession`] never touches a socket: the connection feeds it inbound
//! bytes and collects what it wants to write.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use thiserror::Error;
use tungstenite::handshake::client::generate_key;
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tungstenite::protocol::frame::{CloseFrame, Frame};
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

/// WebSocket failures.
#[derive(Debug, Error)]
pub enum WsError {
    /// Close handshake finished; nothing more can be read or sent.
    #[error("connection closed")]
    Closed,
    /// Framing or protocol violation reported by the codec.
    #[error(transparent)]
    Protocol(#[from] tungstenite::Error),
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsOp {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text.
    Text = 0x1,
    /// Binary data.
    Binary = 0x2,
    /// Close handshake.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl WsOp {
    /// Whether this is a control opcode.
    #[must_use]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A complete (reassembled) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    /// Payload bytes; for [`WsOp::Close`] the status code then the reason.
    pub data: Vec<u8>,
    /// Opcode of the message.
    pub op: WsOp,
}

impl WsMessage {
    /// Payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    fn from_message(message: Message) -> Option<Self> {
        let op = match &message {
            Message::Text(_) => WsOp::Text,
            Message::Binary(_) => WsOp::Binary,
            Message::Ping(_) => WsOp::Ping,
            Message::Pong(_) => WsOp::Pong,
            Message::Close(_) => WsOp::Close,
            Message::Frame(_) => return None,
        };
        let data = match message {
            Message::Close(Some(frame)) => {
                let mut data = u16::from(frame.code).to_be_bytes().to_vec();
                data.extend_from_slice(frame.reason.as_bytes());
                data
            }
            other => other.into_data().to_vec(),
        };
        Some(Self { data, op })
    }
}

/// Byte queues standing in for the socket underneath a session.
#[derive(Debug, Default)]
pub struct WireBuf {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

impl Read for WireBuf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.inbound.read(buf)
    }
}

impl Write for WireBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One side of an upgraded WebSocket connection.
///
/// Server sessions reject unmasked frames; client sessions mask everything
/// they send.
#[derive(Debug)]
pub struct WsSession {
    socket: WebSocket<WireBuf>,
}

impl WsSession {
    /// Session for the accepting side of an upgrade.
    #[must_use]
    pub fn server() -> Self {
        Self::with_role(Role::Server)
    }

    /// Session for the side that sent the upgrade request.
    #[must_use]
    pub fn client() -> Self {
        Self::with_role(Role::Client)
    }

    fn with_role(role: Role) -> Self {
        Self {
            socket: WebSocket::from_raw_socket(WireBuf::default(), role, None),
        }
    }

    /// Queue bytes received from the peer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.socket.get_mut().inbound.extend(bytes);
    }

    /// Bytes the session wants on the wire, emptying its output queue.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.socket.get_mut().outbound)
    }

    /// Next complete message, or `None` until more bytes arrive.
    ///
    /// Pings are answered and close requests acknowledged in the output
    /// queue before the message is returned.
    pub fn read(&mut self) -> Result<Option<WsMessage>, WsError> {
        loop {
            let message = match self.socket.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(closed_or(err)),
            };
            if matches!(message, Message::Ping(_) | Message::Close(_)) {
                self.flush()?;
            }
            if let Some(message) = WsMessage::from_message(message) {
                return Ok(Some(message));
            }
        }
    }

    /// Queue one final frame carrying `data` with opcode `op`.
    ///
    /// Text is sent as given, without UTF-8 validation. For [`WsOp::Close`]
    /// the first two bytes of `data`, if present, are the status code.
    pub fn send(&mut self, op: WsOp, data: &[u8]) -> Result<(), WsError> {
        let message = match op {
            WsOp::Text => Message::Frame(Frame::message(data.to_vec(), OpCode::Data(Data::Text), true)),
            WsOp::Binary => Message::Binary(data.to_vec().into()),
            WsOp::Continuation => Message::Frame(Frame::message(data.to_vec(), OpCode::Data(Data::Continue), true)),
            WsOp::Ping => Message::Ping(data.to_vec().into()),
            WsOp::Pong => Message::Pong(data.to_vec().into()),
            WsOp::Close => Message::Close(close_frame(data)),
        };
        self.socket.send(message).map_err(closed_or)
    }

    fn flush(&mut self) -> Result<(), WsError> {
        match self.socket.flush() {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(closed_or(err)),
        }
    }
}

fn closed_or(err: tungstenite::Error) -> WsError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => WsError::Closed,
        other => WsError::Protocol(other),
    }
}

fn close_frame(data: &[u8]) -> Option<CloseFrame> {
    let [hi, lo, reason @ ..] = data else {
        return None;
    };
    Some(CloseFrame {
        code: CloseCode::from(u16::from_be_bytes([*hi, *lo])),
        reason: String::from_utf8_lossy(reason).into_owned().into(),
    })
}

/// `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    derive_accept_key(client_key.trim().as_bytes())
}

/// Random 16 byte client key, base64 encoded.
#[must_use]
pub fn client_key() -> String {
    generate_key()
}

/// `101 Switching Protocols` response for an upgrade request.
#[must_use]
pub fn upgrade_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

/// Client upgrade request for `path` on `host`.
#[must_use]
pub fn upgrade_request(host: &str, path: &str, client_key: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {client_key}\r\n\r\n"
    )
    .into_bytes()
}
