// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: HTTP server scenario with WebSocket echo, exercised by an external client.
// Author: Lukas Bower

//! HTTP server scenario.
//!
//! Routes served by [`handler`]:
//!
//! | path      | reply                                          |
//! |-----------|------------------------------------------------|
//! | `/foo/*`  | 200 with the text after `/foo/` as the body    |
//! | `/ws`     | WebSocket upgrade, greeting, then echo         |
//! | `/body`   | 200 echoing the request body                   |
//! | otherwise | file or listing from the data directory        |

use std::net::Ipv4Addr;
use std::process::Command;

use log::{debug, error, info, warn};
use tapcheck_stack::http::match_uri;
use tapcheck_stack::{Conn, Event, HttpMessage, Manager, ServeOpts, TlsOpts, WsOp};

use crate::background::with_background_poller;
use crate::check;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::trust::{TrustStore, SERVER_CERT, SERVER_KEY};

/// First frame sent after a successful upgrade.
pub const GREETING: &[u8] = b"opened";

const PARAM_PREFIX: &str = "/foo/";

/// Settings shared by every accepted connection.
#[derive(Debug, Clone)]
pub struct ServerOpts {
    /// Static directory for unmatched paths.
    pub serve: ServeOpts,
    /// Server TLS identity, when serving HTTPS.
    pub tls: Option<TlsOpts>,
}

/// Event handler implementing the scenario's routes.
pub fn handler(opts: ServerOpts) -> impl FnMut(&mut Conn, Event<'_>) + Send + 'static {
    move |conn, event| match event {
        Event::Accept => {
            if let Some(tls) = &opts.tls {
                if let Err(err) = conn.tls_init(tls) {
                    error!("conn {} tls setup failed: {err}", conn.id());
                    conn.close();
                }
            }
        }
        Event::HttpMsg(request) => route(conn, request, &opts.serve),
        Event::WsOpen(request) => {
            check!(request.uri == "/ws");
            conn.ws_send(GREETING, WsOp::Binary);
        }
        Event::WsMsg(message) => {
            conn.ws_send(&message.data, message.op);
        }
        Event::Error(reason) => warn!("conn {} error: {reason}", conn.id()),
        _ => {}
    }
}

fn route(conn: &mut Conn, request: &HttpMessage, serve: &ServeOpts) {
    debug!(
        "[{} {}] message len {}",
        request.method,
        request.uri,
        request.message.len()
    );
    if match_uri(&request.uri, "/foo/*") {
        let suffix = &request.uri[PARAM_PREFIX.len()..];
        conn.http_reply(200, "", suffix);
    } else if match_uri(&request.uri, "/ws") {
        if let Err(err) = conn.ws_upgrade(request) {
            warn!("conn {} upgrade refused: {err}", conn.id());
        }
    } else if match_uri(&request.uri, "/body") {
        conn.http_reply(200, "", &request.body);
    } else {
        conn.serve_dir(request, serve);
    }
}

/// Server TLS identity from the trust store.
pub fn server_tls(trust: &TrustStore) -> Result<TlsOpts, HarnessError> {
    Ok(TlsOpts {
        cert: Some(trust.lookup(SERVER_CERT)?),
        key: Some(trust.lookup(SERVER_KEY)?),
        ..TlsOpts::default()
    })
}

/// Listen on the configured port and require the client command to succeed
/// while a background thread services the manager.
pub fn run(mgr: &mut Manager, cfg: &HarnessConfig, ip: Ipv4Addr) -> Result<(), HarnessError> {
    let tls = if cfg.tls {
        Some(server_tls(&TrustStore::new(&cfg.trust_root))?)
    } else {
        None
    };
    let opts = ServerOpts {
        serve: ServeOpts::new(&cfg.data_dir),
        tls,
    };
    let listener = mgr.http_listen(&cfg.listen_url(), handler(opts))?;
    check!(mgr.conn(listener).is_some_and(Conn::is_listening));

    let command = cfg.client_command(ip);
    info!("running client: {command}");
    let status = with_background_poller(mgr, cfg.budget, || Command::new("sh").arg("-c").arg(&command).status())?;
    let succeeded = match status {
        Ok(status) => {
            debug!("client exited with {status}");
            status.success()
        }
        Err(err) => {
            error!("failed to run client {command:?}: {err}");
            false
        }
    };
    check!(succeeded);

    if let Some(conn) = mgr.conn_mut(listener) {
        conn.close();
    }
    Ok(())
}
