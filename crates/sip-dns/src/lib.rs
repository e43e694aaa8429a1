// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Destination resolution for outbound SIP requests (RFC 3263).
//!
//! [`SipResolver`] turns a request or proxy URI into an ordered list of
//! [`Candidate`]s by consulting NAPTR, SRV, A/AAAA and CNAME records through
//! a [`DnsLookup`] backend: [`TrustDnsLookup`] for real DNS, [`StaticZone`]
//! for in-memory zones.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_core::SipUri;
//! use sip_dns::{Resolver, SipResolver, StaticZone};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let zone = Arc::new(StaticZone::new());
//! zone.address("proxy.example.org", "192.0.2.10".parse().unwrap());
//! let resolver = SipResolver::new(zone);
//! let uri = SipUri::parse("sip:proxy.example.org").unwrap();
//! let candidates = resolver.resolve(&uri).await.unwrap();
//! assert_eq!(candidates[0].addr.to_string(), "192.0.2.10:5060");
//! # });
//! ```

use async_trait::async_trait;
use sip_core::SipUri;
use smol_str::SmolStr;
use thiserror::Error;

pub use sip_transport::{Candidate, TransportKind};

mod lookup;
mod resolver;
mod zone;

pub use lookup::{DnsError, DnsLookup, DnsRecord, RecordKind, TrustDnsLookup};
pub use resolver::{SipResolver, MAX_CNAME_CHAIN};
pub use zone::StaticZone;

/// Why a URI produced no candidates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0}: destination unresolvable")]
    Unresolvable(SmolStr),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("{0}: CNAME chain too long or looping")]
    TooManyCnames(SmolStr),
    #[error(transparent)]
    Dns(#[from] DnsError),
}

/// Trait for destination resolution backends.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Returns a non-empty, ordered candidate list or an error.
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Candidate>, ResolveError>;
}

/// Resolver returning a fixed candidate list, for tests and static routes.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    candidates: Vec<Candidate>,
}

impl StaticResolver {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Candidate>, ResolveError> {
        if self.candidates.is_empty() {
            return Err(ResolveError::Unresolvable(uri.host.clone()));
        }
        Ok(self.candidates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_returns_configured_candidates() {
        let candidates = vec![
            Candidate::new(TransportKind::Udp, "192.0.2.1:5060".parse().unwrap(), "a"),
            Candidate::new(TransportKind::Tcp, "192.0.2.2:5060".parse().unwrap(), "b")
                .with_priority(1),
        ];
        let resolver = StaticResolver::new(candidates.clone());
        let uri = SipUri::parse("sip:test@example.com").unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(resolver.resolve(&uri)).expect("resolve");
        assert_eq!(result, candidates);

        let empty = StaticResolver::new(Vec::new());
        assert_eq!(
            rt.block_on(empty.resolve(&uri)),
            Err(ResolveError::Unresolvable(SmolStr::new("example.com")))
        );
    }
}
