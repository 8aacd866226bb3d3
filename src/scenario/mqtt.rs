// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: MQTT connect, subscribe, publish and disconnect scenario.
// Author: Lukas Bower

//! MQTT round-trip scenario.

use std::sync::mpsc;
use std::time::Duration;

use log::{debug, error, info};
use tapcheck_stack::endpoint::is_tls_url;
use tapcheck_stack::mqtt::random_topic;
use tapcheck_stack::{Event, Manager, MqttOpts};

use crate::check;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::pacing::drive;
use crate::scenario::http_client::client_tls;
use crate::trust::TrustStore;

/// Length of the generated topic name.
pub const TOPIC_LEN: usize = 15;
/// Payload published to the topic.
pub const PAYLOAD: &[u8] = b"hi";

/// Subscribe and publish to a fresh topic on the configured broker, then
/// require exactly one matching message before the session closes.
pub fn run(mgr: &mut Manager, cfg: &HarnessConfig) -> Result<(), HarnessError> {
    let topic = random_topic(TOPIC_LEN);
    let opts = MqttOpts {
        clean: true,
        ..MqttOpts::default()
    };
    let tls = if is_tls_url(&cfg.mqtt_url) {
        Some(client_tls(&cfg.mqtt_url, &TrustStore::new(&cfg.trust_root))?)
    } else {
        None
    };
    let (tx, received) = mpsc::channel();
    let expected = topic.clone();
    let id = mgr.mqtt_connect(&cfg.mqtt_url, &opts, move |conn, event| match event {
        Event::Open => {
            if let Some(tls) = &tls {
                if let Err(err) = conn.tls_init(tls) {
                    error!("conn {} tls setup failed: {err}", conn.id());
                    conn.close();
                }
            }
        }
        Event::MqttOpen => {
            let sub = MqttOpts {
                topic: expected.clone(),
                qos: 1,
                ..MqttOpts::default()
            };
            let publish = MqttOpts {
                message: PAYLOAD.to_vec(),
                retain: false,
                ..sub.clone()
            };
            if let Err(err) = conn.mqtt_sub(&sub).and_then(|_| conn.mqtt_pub(&publish)) {
                error!("conn {} subscribe/publish failed: {err}", conn.id());
                conn.close();
            }
        }
        Event::MqttMsg(message) => {
            debug!("TOPIC: {}, MSG: {}", message.topic, message.text());
            check!(message.topic == expected);
            check!(message.data == PAYLOAD);
            if let Err(err) = conn.mqtt_disconnect() {
                error!("conn {} disconnect failed: {err}", conn.id());
                conn.close();
            }
            let _ = tx.send(message.clone());
        }
        Event::Error(reason) => debug!("conn {} error: {reason}", conn.id()),
        Event::Close => debug!("CLOSE"),
        _ => {}
    })?;
    check!(mgr.conn(id).is_some());

    let finished = drive(mgr, cfg.budget, |mgr| mgr.conn(id).map_or(true, |conn| conn.is_closing()));
    if finished.is_err() {
        if let Some(conn) = mgr.conn_mut(id) {
            conn.close();
        }
    }
    let messages: Vec<_> = received.try_iter().collect();
    let passed = !messages.is_empty();
    info!("mqtt {} on {topic}: {} message(s)", cfg.mqtt_url, messages.len());
    check!(passed);
    check!(messages.len() == 1);
    mgr.poll(Duration::ZERO);
    Ok(())
}
