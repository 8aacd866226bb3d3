// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: HTTP client fetch scenario.
// Author: Lukas Bower

//! HTTP client fetch scenario.

use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use log::{debug, error, info};
use tapcheck_stack::endpoint::{is_tls_url, url_host};
use tapcheck_stack::{ConnId, Event, Manager, TlsOpts};

use crate::check;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::pacing::{drive, PollBudget};
use crate::trust::{TrustStore, LOCAL_CA, PUBLIC_CA};

/// Outcome of one fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetch {
    /// Response status, 0 when no response arrived.
    pub status: u16,
    /// Raw response bytes.
    pub message: Vec<u8>,
    /// The connection finished, with or without a response.
    pub closed: bool,
}

enum Progress {
    Response { status: u16, message: Vec<u8> },
    Closed,
}

impl Fetch {
    fn absorb(&mut self, updates: &Receiver<Progress>) {
        for update in updates.try_iter() {
            match update {
                Progress::Response { status, message } => {
                    self.status = status;
                    self.message = message;
                    self.closed = true;
                }
                Progress::Closed => self.closed = true,
            }
        }
    }
}

/// Client TLS options for `url`: the public CA, or the local one for loopback hosts.
pub fn client_tls(url: &str, trust: &TrustStore) -> Result<TlsOpts, HarnessError> {
    let name = url_host(url);
    let ca_path = if url.contains("localhost") { LOCAL_CA } else { PUBLIC_CA };
    Ok(TlsOpts {
        name,
        ca: Some(trust.lookup(ca_path)?),
        ..TlsOpts::default()
    })
}

/// Send `request` to `url` and wait for the response or the connection to end.
///
/// A connection still open when the budget runs out is closed before
/// returning.
pub fn fetch(
    mgr: &mut Manager,
    url: &str,
    request: &str,
    trust: &TrustStore,
    budget: PollBudget,
) -> Result<Fetch, HarnessError> {
    let tls = if is_tls_url(url) {
        Some(client_tls(url, trust)?)
    } else {
        None
    };
    let (tx, updates) = mpsc::channel();
    let request = request.as_bytes().to_vec();
    let id = mgr.http_connect(url, move |conn, event| match event {
        Event::Open => {
            if let Some(opts) = &tls {
                if let Err(err) = conn.tls_init(opts) {
                    error!("conn {} tls setup failed: {err}", conn.id());
                    conn.close();
                }
            }
        }
        Event::Connect => {
            conn.send(&request);
        }
        Event::HttpMsg(response) => {
            let status = response.status().unwrap_or(0);
            debug!("CODE: {status}, MSG: {}", response.message_text());
            let _ = tx.send(Progress::Response {
                status,
                message: response.message.clone(),
            });
            conn.close();
        }
        Event::Error(reason) => debug!("conn {} error: {reason}", conn.id()),
        Event::Close => {
            let _ = tx.send(Progress::Closed);
        }
        _ => {}
    })?;
    check!(mgr.conn(id).is_some());

    let mut outcome = Fetch::default();
    let waited = drive(mgr, budget, |_| {
        outcome.absorb(&updates);
        outcome.closed
    });
    if waited.is_err() {
        close_if_open(mgr, id);
    }
    mgr.poll(Duration::ZERO);
    outcome.absorb(&updates);
    info!("fetch {url} -> {} ({} bytes)", outcome.status, outcome.message.len());
    Ok(outcome)
}

fn close_if_open(mgr: &mut Manager, id: ConnId) {
    if let Some(conn) = mgr.conn_mut(id) {
        conn.close();
    }
}

/// Fetch the configured URL and require the configured status.
pub fn run(mgr: &mut Manager, cfg: &HarnessConfig) -> Result<(), HarnessError> {
    let trust = TrustStore::new(&cfg.trust_root);
    let request = cfg.http_request()?;
    let outcome = fetch(mgr, &cfg.http_url, &request, &trust, cfg.budget)?;
    check!(outcome.status == cfg.expect_status);
    Ok(())
}
