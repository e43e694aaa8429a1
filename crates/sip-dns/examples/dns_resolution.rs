// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Resolves SIP URIs per RFC 3263 against an in-memory zone and, for any
/// URIs given on the command line, against the system resolver.
///
/// Run with: cargo run --example dns_resolution -- sip:example.com
use std::sync::Arc;

use anyhow::Context;
use sip_core::SipUri;
use sip_dns::{Candidate, Resolver, SipResolver, StaticZone};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let zone = Arc::new(StaticZone::new());
    zone.naptr("example.com", 10, 10, "s", "SIP+D2T", "_sip._tcp.example.com")
        .naptr("example.com", 10, 20, "s", "SIP+D2U", "_sip._udp.example.com")
        .srv("_sip._tcp.example.com", 0, 0, 5060, "sip1.example.com")
        .srv("_sip._udp.example.com", 0, 0, 5060, "sip1.example.com")
        .cname("sip1.example.com", "edge.example.com")
        .address("edge.example.com", "192.0.2.10".parse()?)
        .address("edge.example.com", "2001:db8::10".parse()?);

    let resolver = SipResolver::new(zone);
    for uri in ["sip:example.com", "sip:example.com;transport=udp", "sip:192.0.2.1:5070"] {
        println!("{uri}");
        let uri = SipUri::parse(uri).context("invalid uri")?;
        match resolver.resolve(&uri).await {
            Ok(candidates) => print_candidates(&candidates),
            Err(e) => println!("   {e}"),
        }
    }

    let system = SipResolver::from_system();
    for arg in std::env::args().skip(1) {
        println!("{arg} (system DNS)");
        let uri = SipUri::parse(&arg).with_context(|| format!("invalid uri {arg}"))?;
        match system.resolve(&uri).await {
            Ok(candidates) => print_candidates(&candidates),
            Err(e) => println!("   {e}"),
        }
    }
    Ok(())
}

fn print_candidates(candidates: &[Candidate]) {
    for candidate in candidates {
        println!(
            "   [{}] {} via {}",
            candidate.priority, candidate.addr, candidate.transport
        );
    }
}
