// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Optional rustls record layer attached to event manager connections.
// Author: Lukas Bower

//! Secure transport for connections.
//!
//! With the `tls` feature a [`Tls`] session wraps a rustls client or server
//! connection and shuttles records between the TCP socket and the plaintext
//! buffers. Without it every attempt fails with
//! [`StackError::TlsUnavailable`].

use crate::error::StackError;

/// Material used to set up a TLS session.
///
/// Certificates and keys are PEM encoded. Clients verify the peer against
/// `ca` using `name`; servers present `cert` and `key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOpts {
    /// Server name used for SNI and certificate verification.
    pub name: Option<String>,
    /// PEM encoded trust anchors.
    pub ca: Option<Vec<u8>>,
    /// PEM encoded certificate chain presented by a server.
    pub cert: Option<Vec<u8>>,
    /// PEM encoded private key matching `cert`.
    pub key: Option<Vec<u8>>,
}

/// Whether this build can establish TLS sessions.
#[must_use]
pub fn available() -> bool {
    cfg!(feature = "tls")
}

#[cfg(feature = "tls")]
mod imp {
    use std::io::{Read, Write};
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

    use super::TlsOpts;
    use crate::error::StackError;

    fn tls_err(err: impl std::fmt::Display) -> StackError {
        StackError::Tls(err.to_string())
    }

    fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, StackError> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StackError::Tls(format!("invalid certificate PEM: {err}")))?;
        if certs.is_empty() {
            return Err(StackError::Tls("no certificates found in PEM".into()));
        }
        Ok(certs)
    }

    /// TLS session bound to one connection.
    pub(crate) struct Tls {
        conn: Connection,
    }

    impl Tls {
        pub(crate) fn client(opts: &TlsOpts) -> Result<Self, StackError> {
            let mut roots = RootCertStore::empty();
            if let Some(ca) = &opts.ca {
                for cert in parse_certs(ca)? {
                    roots.add(cert).map_err(tls_err)?;
                }
            }
            let name = opts
                .name
                .clone()
                .ok_or_else(|| StackError::Tls("client session requires a server name".into()))?;
            let server_name = ServerName::try_from(name).map_err(tls_err)?;
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let conn = ClientConnection::new(Arc::new(config), server_name).map_err(tls_err)?;
            Ok(Self {
                conn: Connection::Client(conn),
            })
        }

        pub(crate) fn server(opts: &TlsOpts) -> Result<Self, StackError> {
            let (Some(cert), Some(key)) = (&opts.cert, &opts.key) else {
                return Err(StackError::Tls("server session requires cert and key".into()));
            };
            let chain = parse_certs(cert)?;
            let key = rustls_pemfile::private_key(&mut &key[..])
                .map_err(|err| StackError::Tls(format!("invalid key PEM: {err}")))?
                .ok_or_else(|| StackError::Tls("no private key found in PEM".into()))?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .map_err(tls_err)?;
            let conn = ServerConnection::new(Arc::new(config)).map_err(tls_err)?;
            Ok(Self {
                conn: Connection::Server(conn),
            })
        }

        /// Feed ciphertext from the socket, appending any plaintext to `plain`.
        pub(crate) fn read_wire(&mut self, mut wire: &[u8], plain: &mut Vec<u8>) -> Result<(), StackError> {
            while !wire.is_empty() {
                self.conn.read_tls(&mut wire)?;
                let state = self.conn.process_new_packets().map_err(tls_err)?;
                let available = state.plaintext_bytes_to_read();
                if available > 0 {
                    let start = plain.len();
                    plain.resize(start + available, 0);
                    self.conn.reader().read_exact(&mut plain[start..])?;
                }
            }
            Ok(())
        }

        /// Queue plaintext for encryption.
        pub(crate) fn write_plain(&mut self, data: &[u8]) -> Result<(), StackError> {
            self.conn.writer().write_all(data)?;
            Ok(())
        }

        /// Move pending records into `wire`.
        pub(crate) fn write_wire(&mut self, wire: &mut Vec<u8>) -> Result<(), StackError> {
            while self.conn.wants_write() {
                self.conn.write_tls(wire)?;
            }
            Ok(())
        }

        pub(crate) fn is_handshaking(&self) -> bool {
            self.conn.is_handshaking()
        }

        pub(crate) fn close_notify(&mut self) {
            self.conn.send_close_notify();
        }
    }
}

#[cfg(not(feature = "tls"))]
mod imp {
    use super::TlsOpts;
    use crate::error::StackError;

    /// Placeholder session type; never constructed without the `tls` feature.
    pub(crate) enum Tls {}

    impl Tls {
        pub(crate) fn client(_opts: &TlsOpts) -> Result<Self, StackError> {
            Err(StackError::TlsUnavailable)
        }

        pub(crate) fn server(_opts: &TlsOpts) -> Result<Self, StackError> {
            Err(StackError::TlsUnavailable)
        }

        pub(crate) fn read_wire(&mut self, _wire: &[u8], _plain: &mut Vec<u8>) -> Result<(), StackError> {
            match *self {}
        }

        pub(crate) fn write_plain(&mut self, _data: &[u8]) -> Result<(), StackError> {
            match *self {}
        }

        pub(crate) fn write_wire(&mut self, _wire: &mut Vec<u8>) -> Result<(), StackError> {
            match *self {}
        }

        pub(crate) fn is_handshaking(&self) -> bool {
            match *self {}
        }

        pub(crate) fn close_notify(&mut self) {
            match *self {}
        }
    }
}

pub(crate) use imp::Tls;

/// Session for a client connection (`server == false`) or an accepted one.
pub(crate) fn session(opts: &TlsOpts, server: bool) -> Result<Tls, StackError> {
    if server {
        Tls::server(opts)
    } else {
        Tls::client(opts)
    }
}
