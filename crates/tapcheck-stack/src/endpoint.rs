// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Parse connect and listen URLs into scheme, host and port.
// Author: Lukas Bower

use std::net::Ipv4Addr;

use url::Url;

use crate::error::StackError;

/// URL schemes accepted by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Raw TCP.
    Tcp,
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// Plain WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
    /// Plain MQTT.
    Mqtt,
    /// MQTT over TLS.
    Mqtts,
}

impl Scheme {
    fn parse(text: &str) -> Result<Self, StackError> {
        Ok(match text {
            "tcp" => Self::Tcp,
            "http" => Self::Http,
            "https" => Self::Https,
            "ws" => Self::Ws,
            "wss" => Self::Wss,
            "mqtt" => Self::Mqtt,
            "mqtts" => Self::Mqtts,
            other => return Err(StackError::UnsupportedScheme(other.to_owned())),
        })
    }

    /// Port used when the URL does not name one.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Tcp | Self::Http | Self::Ws => 80,
            Self::Https | Self::Wss => 443,
            Self::Mqtt => 1883,
            Self::Mqtts => 8883,
        }
    }

    /// Whether the scheme implies TLS.
    #[must_use]
    pub fn is_tls(self) -> bool {
        matches!(self, Self::Https | Self::Wss | Self::Mqtts)
    }
}

/// Host part of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// Literal IPv4 address.
    Addr(Ipv4Addr),
    /// Name that must be resolved first.
    Name(String),
}

/// Parsed connect or listen target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// URL scheme.
    pub scheme: Scheme,
    /// Host to dial or bind.
    pub host: Host,
    /// Port, defaulted from the scheme when absent.
    pub port: u16,
    /// Path component, `/` when absent.
    pub path: String,
}

impl Endpoint {
    /// Parse `url`.
    pub fn parse(url: &str) -> Result<Self, StackError> {
        let parsed = Url::parse(url).map_err(|err| StackError::InvalidUrl {
            url: url.to_owned(),
            reason: err.to_string(),
        })?;
        let scheme = Scheme::parse(parsed.scheme())?;
        let host_text = parsed.host_str().ok_or_else(|| StackError::InvalidUrl {
            url: url.to_owned(),
            reason: "missing host".into(),
        })?;
        let host = match host_text.parse::<Ipv4Addr>() {
            Ok(addr) => Host::Addr(addr),
            Err(_) => Host::Name(host_text.to_owned()),
        };
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());
        let path = if parsed.path().is_empty() {
            "/".to_owned()
        } else {
            parsed.path().to_owned()
        };
        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Host as text, suitable for SNI or a `Host:` header.
    #[must_use]
    pub fn host_name(&self) -> String {
        match &self.host {
            Host::Addr(addr) => addr.to_string(),
            Host::Name(name) => name.clone(),
        }
    }
}

/// Host portion of `url`, if it parses.
#[must_use]
pub fn url_host(url: &str) -> Option<String> {
    Endpoint::parse(url).ok().map(|endpoint| endpoint.host_name())
}

/// Whether `url` names a TLS scheme.
#[must_use]
pub fn is_tls_url(url: &str) -> bool {
    Endpoint::parse(url).is_ok_and(|endpoint| endpoint.scheme.is_tls())
}
