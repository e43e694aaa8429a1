// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use smol_str::SmolStr;
use thiserror::Error;
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError as TrustResolveError, ResolveErrorKind},
    proto::{
        op::ResponseCode,
        rr::{Name, RData, RecordType},
    },
    TokioAsyncResolver,
};

/// Record types the SIP resolver asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Aaaa,
    Naptr,
    Srv,
    Cname,
}

impl RecordKind {
    fn record_type(self) -> RecordType {
        match self {
            RecordKind::A => RecordType::A,
            RecordKind::Aaaa => RecordType::AAAA,
            RecordKind::Naptr => RecordType::NAPTR,
            RecordKind::Srv => RecordType::SRV,
            RecordKind::Cname => RecordType::CNAME,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record_type(), f)
    }
}

/// One answer record. Names are stored lowercase without the trailing dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecord {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Naptr {
        order: u16,
        preference: u16,
        flags: SmolStr,
        service: SmolStr,
        replacement: SmolStr,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: SmolStr,
    },
    Cname(SmolStr),
}

/// Failure of a single DNS query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("{0}: no such domain")]
    NxDomain(SmolStr),
    #[error("{name}: no {kind} records")]
    NoRecords { name: SmolStr, kind: RecordKind },
    #[error("dns query failed: {0}")]
    Failed(String),
}

/// DNS collaborator used by [`crate::SipResolver`].
///
/// An answer for an alias contains the `Cname` record (and may contain the
/// target's records too, as real resolvers return them); the caller follows
/// the chain.
#[async_trait]
pub trait DnsLookup: Send + Sync + 'static {
    async fn query(&self, name: &str, kind: RecordKind) -> Result<Vec<DnsRecord>, DnsError>;
}

pub(crate) fn normalize_name(name: &str) -> SmolStr {
    SmolStr::new(name.trim_end_matches('.').to_ascii_lowercase())
}

/// [`DnsLookup`] over `trust-dns-resolver`.
#[derive(Clone)]
pub struct TrustDnsLookup {
    resolver: TokioAsyncResolver,
}

impl TrustDnsLookup {
    /// Uses the host's resolv.conf, falling back to the library defaults.
    pub fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

fn name_to_string(name: &Name) -> SmolStr {
    normalize_name(&name.to_utf8())
}

fn convert(rdata: &RData) -> Option<DnsRecord> {
    match rdata {
        RData::A(a) => Some(DnsRecord::A(a.0)),
        RData::AAAA(aaaa) => Some(DnsRecord::Aaaa(aaaa.0)),
        RData::CNAME(cname) => Some(DnsRecord::Cname(name_to_string(&cname.0))),
        RData::SRV(srv) => Some(DnsRecord::Srv {
            priority: srv.priority(),
            weight: srv.weight(),
            port: srv.port(),
            target: name_to_string(srv.target()),
        }),
        RData::NAPTR(naptr) => Some(DnsRecord::Naptr {
            order: naptr.order(),
            preference: naptr.preference(),
            flags: SmolStr::new(String::from_utf8_lossy(naptr.flags()).to_ascii_lowercase()),
            service: SmolStr::new(String::from_utf8_lossy(naptr.services()).to_ascii_uppercase()),
            replacement: name_to_string(naptr.replacement()),
        }),
        _ => None,
    }
}

fn map_error(name: &str, kind: RecordKind, err: TrustResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. }
            if *response_code == ResponseCode::NXDomain =>
        {
            DnsError::NxDomain(normalize_name(name))
        }
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NoRecords {
            name: normalize_name(name),
            kind,
        },
        _ => DnsError::Failed(err.to_string()),
    }
}

#[async_trait]
impl DnsLookup for TrustDnsLookup {
    async fn query(&self, name: &str, kind: RecordKind) -> Result<Vec<DnsRecord>, DnsError> {
        // Fully qualified so the search list is not applied.
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        let lookup = self
            .resolver
            .lookup(fqdn, kind.record_type())
            .await
            .map_err(|e| map_error(name, kind, e))?;
        let records: Vec<DnsRecord> = lookup.iter().filter_map(convert).collect();
        if records.is_empty() {
            return Err(DnsError::NoRecords {
                name: normalize_name(name),
                kind,
            });
        }
        Ok(records)
    }
}
