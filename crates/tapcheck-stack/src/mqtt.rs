// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: MQTT 3.1.1 packet codec, client options and session bookkeeping.
// Author: Lukas Bower

//! MQTT 3.1.1 wire codec.
//!
//! Only protocol level 4 is spoken. QoS 0 and 1 are supported end to end;
//! QoS 2 publishes decode but are never acknowledged.

use std::time::Instant;

use rand::distr::Alphanumeric;
use rand::Rng;
use thiserror::Error;

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

const PROTOCOL_NAME: &str = "MQTT";
const MAX_REMAINING_LEN: usize = 268_435_455;

/// MQTT framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MqttError {
    /// Remaining length used more than four bytes.
    #[error("malformed remaining length")]
    MalformedLength,
    /// Packet body ended before a field was complete.
    #[error("packet body truncated")]
    Truncated,
    /// String field was not valid UTF-8.
    #[error("string field is not utf-8")]
    InvalidUtf8,
    /// Packet type this client does not handle.
    #[error("unsupported packet type {0}")]
    UnsupportedPacket(u8),
    /// Protocol level other than 3.1.1.
    #[error("unsupported protocol level {0}")]
    UnsupportedVersion(u8),
    /// QoS value outside 0..=2.
    #[error("invalid qos {0}")]
    InvalidQos(u8),
    /// Field too long for the wire format.
    #[error("field of {0} bytes is too long")]
    FieldTooLong(usize),
}

/// Options for connect, subscribe and publish requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOpts {
    /// Client identifier; a random one is generated when empty.
    pub client_id: String,
    /// Optional user name.
    pub user: Option<String>,
    /// Optional password.
    pub pass: Option<Vec<u8>>,
    /// Topic for subscribe, publish or the will message.
    pub topic: String,
    /// Publish payload or will message.
    pub message: Vec<u8>,
    /// Quality of service level.
    pub qos: u8,
    /// Retain flag for publish or will.
    pub retain: bool,
    /// Clean session flag.
    pub clean: bool,
    /// Keepalive interval in seconds, 0 disables pings.
    pub keepalive: u16,
    /// Protocol level, must be [`PROTOCOL_LEVEL`].
    pub version: u8,
    /// Register `topic`/`message` as the will on connect.
    pub will: bool,
}

impl Default for MqttOpts {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            user: None,
            pass: None,
            topic: String::new(),
            message: Vec::new(),
            qos: 0,
            retain: false,
            clean: true,
            keepalive: 0,
            version: PROTOCOL_LEVEL,
            will: false,
        }
    }
}

/// Message delivered by a PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    /// Topic name.
    pub topic: String,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Delivery QoS.
    pub qos: u8,
    /// Packet identifier, 0 for QoS 0.
    pub id: u16,
    /// Retain flag.
    pub retain: bool,
    /// Duplicate delivery flag.
    pub dup: bool,
}

impl MqttMessage {
    /// Payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Will message registered at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Will topic.
    pub topic: String,
    /// Will payload.
    pub message: Vec<u8>,
    /// Will QoS.
    pub qos: u8,
    /// Will retain flag.
    pub retain: bool,
}

/// CONNECT packet fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol level.
    pub level: u8,
    /// Client identifier.
    pub client_id: String,
    /// Clean session flag.
    pub clean: bool,
    /// Keepalive in seconds.
    pub keepalive: u16,
    /// Optional will.
    pub will: Option<Will>,
    /// Optional user name.
    pub user: Option<String>,
    /// Optional password.
    pub pass: Option<Vec<u8>>,
}

/// PUBLISH packet fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Topic name.
    pub topic: String,
    /// Payload.
    pub payload: Vec<u8>,
    /// QoS level.
    pub qos: u8,
    /// Retain flag.
    pub retain: bool,
    /// Duplicate flag.
    pub dup: bool,
    /// Packet identifier, only meaningful for QoS above 0.
    pub id: u16,
}

/// Control packets understood by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT.
    Connect(Connect),
    /// CONNACK.
    ConnAck {
        /// Session present flag.
        session_present: bool,
        /// Return code, 0 on success.
        code: u8,
    },
    /// PUBLISH.
    Publish(Publish),
    /// PUBACK.
    PubAck {
        /// Acknowledged packet identifier.
        id: u16,
    },
    /// SUBSCRIBE.
    Subscribe {
        /// Packet identifier.
        id: u16,
        /// Topic filters with requested QoS.
        topics: Vec<(String, u8)>,
    },
    /// SUBACK.
    SubAck {
        /// Packet identifier.
        id: u16,
        /// Granted QoS per filter, 0x80 on failure.
        codes: Vec<u8>,
    },
    /// UNSUBSCRIBE.
    Unsubscribe {
        /// Packet identifier.
        id: u16,
        /// Topic filters.
        topics: Vec<String>,
    },
    /// UNSUBACK.
    UnsubAck {
        /// Packet identifier.
        id: u16,
    },
    /// PINGREQ.
    PingReq,
    /// PINGRESP.
    PingResp,
    /// DISCONNECT.
    Disconnect,
}

impl Packet {
    /// Serialise the packet including its fixed header.
    pub fn encode(&self) -> Result<Vec<u8>, MqttError> {
        let mut body = Vec::new();
        let header = match self {
            Self::Connect(connect) => {
                put_str(&mut body, PROTOCOL_NAME)?;
                body.push(connect.level);
                let mut flags = 0u8;
                if connect.clean {
                    flags |= 0x02;
                }
                if let Some(will) = &connect.will {
                    flags |= 0x04 | (will.qos & 0x03) << 3;
                    if will.retain {
                        flags |= 0x20;
                    }
                }
                if connect.pass.is_some() {
                    flags |= 0x40;
                }
                if connect.user.is_some() {
                    flags |= 0x80;
                }
                body.push(flags);
                body.extend_from_slice(&connect.keepalive.to_be_bytes());
                put_str(&mut body, &connect.client_id)?;
                if let Some(will) = &connect.will {
                    put_str(&mut body, &will.topic)?;
                    put_bytes(&mut body, &will.message)?;
                }
                if let Some(user) = &connect.user {
                    put_str(&mut body, user)?;
                }
                if let Some(pass) = &connect.pass {
                    put_bytes(&mut body, pass)?;
                }
                0x10
            }
            Self::ConnAck {
                session_present,
                code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*code);
                0x20
            }
            Self::Publish(publish) => {
                if publish.qos > 2 {
                    return Err(MqttError::InvalidQos(publish.qos));
                }
                put_str(&mut body, &publish.topic)?;
                if publish.qos > 0 {
                    body.extend_from_slice(&publish.id.to_be_bytes());
                }
                body.extend_from_slice(&publish.payload);
                0x30 | u8::from(publish.dup) << 3 | publish.qos << 1 | u8::from(publish.retain)
            }
            Self::PubAck { id } => {
                body.extend_from_slice(&id.to_be_bytes());
                0x40
            }
            Self::Subscribe { id, topics } => {
                body.extend_from_slice(&id.to_be_bytes());
                for (topic, qos) in topics {
                    put_str(&mut body, topic)?;
                    body.push(*qos & 0x03);
                }
                0x82
            }
            Self::SubAck { id, codes } => {
                body.extend_from_slice(&id.to_be_bytes());
                body.extend_from_slice(codes);
                0x90
            }
            Self::Unsubscribe { id, topics } => {
                body.extend_from_slice(&id.to_be_bytes());
                for topic in topics {
                    put_str(&mut body, topic)?;
                }
                0xa2
            }
            Self::UnsubAck { id } => {
                body.extend_from_slice(&id.to_be_bytes());
                0xb0
            }
            Self::PingReq => 0xc0,
            Self::PingResp => 0xd0,
            Self::Disconnect => 0xe0,
        };
        if body.len() > MAX_REMAINING_LEN {
            return Err(MqttError::FieldTooLong(body.len()));
        }
        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(header);
        put_remaining_len(&mut out, body.len());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn put_remaining_len(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<(), MqttError> {
    let len = u16::try_from(data.len()).map_err(|_| MqttError::FieldTooLong(data.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, text: &str) -> Result<(), MqttError> {
    put_bytes(out, text.as_bytes())
}

/// Decode the variable length header, returning `(length, bytes used)`.
fn remaining_len(buf: &[u8]) -> Result<Option<(usize, usize)>, MqttError> {
    let mut value = 0usize;
    for (idx, byte) in buf.iter().enumerate() {
        if idx == 4 {
            return Err(MqttError::MalformedLength);
        }
        value |= usize::from(byte & 0x7f) << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(Some((value, idx + 1)));
        }
    }
    if buf.len() >= 4 {
        Err(MqttError::MalformedLength)
    } else {
        Ok(None)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], MqttError> {
        if self.buf.len() < len {
            return Err(MqttError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, MqttError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MqttError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, MqttError> {
        let len = usize::from(self.u16()?);
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, MqttError> {
        String::from_utf8(self.bytes()?).map_err(|_| MqttError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn decode_connect(cur: &mut Cursor<'_>) -> Result<Connect, MqttError> {
    let name = cur.string()?;
    let level = cur.u8()?;
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(MqttError::UnsupportedVersion(level));
    }
    let flags = cur.u8()?;
    let keepalive = cur.u16()?;
    let client_id = cur.string()?;
    let will = if flags & 0x04 != 0 {
        Some(Will {
            topic: cur.string()?,
            message: cur.bytes()?,
            qos: (flags >> 3) & 0x03,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let user = if flags & 0x80 != 0 {
        Some(cur.string()?)
    } else {
        None
    };
    let pass = if flags & 0x40 != 0 {
        Some(cur.bytes()?)
    } else {
        None
    };
    Ok(Connect {
        level,
        client_id,
        clean: flags & 0x02 != 0,
        keepalive,
        will,
        user,
        pass,
    })
}

/// Decode one packet from the front of `buf`.
///
/// Returns the packet and the number of bytes consumed, or `None` until the
/// whole packet has arrived.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, MqttError> {
    let Some((&header, rest)) = buf.split_first() else {
        return Ok(None);
    };
    let Some((len, len_bytes)) = remaining_len(rest)? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + len;
    if buf.len() < total {
        return Ok(None);
    }
    let mut cur = Cursor {
        buf: &buf[1 + len_bytes..total],
    };
    let packet = match header >> 4 {
        1 => Packet::Connect(decode_connect(&mut cur)?),
        2 => Packet::ConnAck {
            session_present: cur.u8()? & 0x01 != 0,
            code: cur.u8()?,
        },
        3 => {
            let qos = (header >> 1) & 0x03;
            if qos == 3 {
                return Err(MqttError::InvalidQos(qos));
            }
            let topic = cur.string()?;
            let id = if qos > 0 { cur.u16()? } else { 0 };
            Packet::Publish(Publish {
                topic,
                payload: cur.rest().to_vec(),
                qos,
                retain: header & 0x01 != 0,
                dup: header & 0x08 != 0,
                id,
            })
        }
        4 => Packet::PubAck { id: cur.u16()? },
        8 => {
            let id = cur.u16()?;
            let mut topics = Vec::new();
            while !cur.is_empty() {
                let topic = cur.string()?;
                topics.push((topic, cur.u8()? & 0x03));
            }
            Packet::Subscribe { id, topics }
        }
        9 => Packet::SubAck {
            id: cur.u16()?,
            codes: cur.rest().to_vec(),
        },
        10 => {
            let id = cur.u16()?;
            let mut topics = Vec::new();
            while !cur.is_empty() {
                topics.push(cur.string()?);
            }
            Packet::Unsubscribe { id, topics }
        }
        11 => Packet::UnsubAck { id: cur.u16()? },
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        other => return Err(MqttError::UnsupportedPacket(other)),
    };
    Ok(Some((packet, total)))
}

/// Random alphanumeric string of `len` characters, used for throwaway topics.
#[must_use]
pub fn random_topic(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Build a CONNECT packet from client options.
pub(crate) fn connect_packet(opts: &MqttOpts) -> Result<Packet, MqttError> {
    if opts.version != PROTOCOL_LEVEL {
        return Err(MqttError::UnsupportedVersion(opts.version));
    }
    let client_id = if opts.client_id.is_empty() {
        format!("tapcheck-{}", random_topic(12))
    } else {
        opts.client_id.clone()
    };
    let will = opts.will.then(|| Will {
        topic: opts.topic.clone(),
        message: opts.message.clone(),
        qos: opts.qos,
        retain: opts.retain,
    });
    Ok(Packet::Connect(Connect {
        level: PROTOCOL_LEVEL,
        client_id,
        clean: opts.clean,
        keepalive: opts.keepalive,
        will,
        user: opts.user.clone(),
        pass: opts.pass.clone(),
    }))
}

/// Client side session state kept per connection.
#[derive(Debug)]
pub(crate) struct Session {
    next_id: u16,
    pub(crate) keepalive: u16,
    pub(crate) last_tx: Instant,
    pub(crate) connect: Option<Packet>,
}

impl Session {
    pub(crate) fn new(connect: Packet, keepalive: u16) -> Self {
        Self {
            next_id: 1,
            keepalive,
            last_tx: Instant::now(),
            connect: Some(connect),
        }
    }

    /// Next non-zero packet identifier.
    pub(crate) fn next_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_encodes_clean_session_level_four() {
        let opts = MqttOpts {
            client_id: "cid".into(),
            keepalive: 30,
            ..MqttOpts::default()
        };
        let bytes = connect_packet(&opts).expect("packet").encode().expect("encode");
        assert_eq!(
            bytes,
            [
                0x10, 15, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x02, 0, 30, 0, 3, b'c', b'i', b'd'
            ]
        );
        let (decoded, used) = decode(&bytes).expect("decode").expect("complete");
        assert_eq!(used, bytes.len());
        let Packet::Connect(connect) = decoded else {
            panic!("expected connect");
        };
        assert!(connect.clean);
        assert_eq!(connect.client_id, "cid");
    }

    #[test]
    fn other_protocol_levels_are_refused() {
        let opts = MqttOpts {
            version: 5,
            ..MqttOpts::default()
        };
        assert_eq!(connect_packet(&opts), Err(MqttError::UnsupportedVersion(5)));
    }

    #[test]
    fn publish_qos1_carries_id() {
        let packet = Packet::Publish(Publish {
            topic: "a/b".into(),
            payload: b"hi".to_vec(),
            qos: 1,
            retain: false,
            dup: false,
            id: 7,
        });
        let bytes = packet.encode().expect("encode");
        assert_eq!(bytes[0], 0x32);
        let (decoded, _) = decode(&bytes).expect("decode").expect("complete");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn partial_packets_wait() {
        let bytes = Packet::SubAck {
            id: 1,
            codes: vec![1],
        }
        .encode()
        .expect("encode");
        assert_eq!(decode(&bytes[..2]).expect("decode"), None);
        assert_eq!(decode(&[]).expect("decode"), None);
    }

    #[test]
    fn long_remaining_length() {
        let packet = Packet::Publish(Publish {
            topic: "t".into(),
            payload: vec![0x5a; 200],
            qos: 0,
            retain: true,
            dup: false,
            id: 0,
        });
        let bytes = packet.encode().expect("encode");
        assert_eq!(&bytes[1..3], &[0xcb, 0x01]);
        assert_eq!(decode(&bytes).expect("decode").map(|(p, _)| p), Some(packet));
    }

    #[test]
    fn malformed_length_is_rejected() {
        assert_eq!(
            decode(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(MqttError::MalformedLength)
        );
    }

    #[test]
    fn random_topic_is_alphanumeric() {
        let topic = random_topic(15);
        assert_eq!(topic.len(), 15);
        assert!(topic.chars().all(|ch| ch.is_ascii_alphanumeric()));
        assert_ne!(topic, random_topic(15));
    }

    #[test]
    fn packet_ids_skip_zero() {
        let connect = connect_packet(&MqttOpts::default()).expect("packet");
        let mut session = Session::new(connect, 0);
        session.next_id = u16::MAX;
        assert_eq!(session.next_id(), u16::MAX);
        assert_eq!(session.next_id(), 1);
    }
}
