// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sends one OPTIONS request and prints the outcome.
//!
//! Run with: cargo run --example send_options -- sip:example.com
//!
//! `SIPHON_AGENT_CONFIG` may name a JSON file with `AgentConfig` overrides.
//! Logging is controlled by `RUST_LOG` (default `info`).

use std::{env, fs, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use sip_core::{Method, SipUri};
use sip_transaction::{AgentConfig, TransactionAgent};
use sip_transport::TokioConnector;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let target = env::args()
        .nth(1)
        .unwrap_or_else(|| "sip:127.0.0.1:5060".to_owned());
    let target = SipUri::parse(&target).with_context(|| format!("invalid SIP URI {target}"))?;

    let config = match env::var("SIPHON_AGENT_CONFIG") {
        Ok(path) => {
            let json = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            AgentConfig::from_json_str(&json)?
        }
        Err(_) => AgentConfig::default(),
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let connector = TokioConnector::new(inbound_tx).with_connect_timeout(config.connect_timeout);
    let local = connector.bind_udp("0.0.0.0:0".parse()?).await?;
    tracing::info!(%local, "udp bound");

    let agent = TransactionAgent::with_system_dns(config, Arc::new(connector));
    agent.spawn_inbound(inbound_rx);

    let (tx, rx) = oneshot::channel();
    agent
        .create_transaction(Method::Options, target, Bytes::new(), move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;

    let outcome = rx.await.context("agent stopped before the transaction finished")?;
    match outcome.response() {
        Some(response) => println!("{} {}", response.code(), response.reason()),
        None => println!("{} ({:?})", outcome.status(), outcome),
    }

    agent.shutdown().await;
    Ok(())
}
