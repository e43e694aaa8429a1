// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use sip_core::SipUri;
use sip_transport::{Candidate, TransportKind};
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::lookup::{normalize_name, DnsError, DnsLookup, DnsRecord, RecordKind, TrustDnsLookup};
use crate::{ResolveError, Resolver};

/// Longest CNAME chain followed before giving up on a name.
pub const MAX_CNAME_CHAIN: usize = 8;

/// Result of NAPTR record parsing (RFC 3263 §4.1).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NaptrRecord {
    order: u16,
    preference: u16,
    transport: TransportKind,
    srv: bool,
    replacement: SmolStr,
}

/// Maps a NAPTR service field to a transport.
fn naptr_transport(service: &str) -> Option<TransportKind> {
    match service {
        "SIPS+D2T" => Some(TransportKind::Tls),
        "SIP+D2T" => Some(TransportKind::Tcp),
        "SIP+D2U" => Some(TransportKind::Udp),
        _ => None,
    }
}

fn srv_prefix(transport: TransportKind) -> &'static str {
    match transport {
        TransportKind::Udp => "_sip._udp",
        TransportKind::Tcp => "_sip._tcp",
        TransportKind::Tls => "_sips._tcp",
    }
}

/// DNS resolver implementing the RFC 3263 client procedure.
///
/// Resolution follows this order:
/// 1. Numeric host: single candidate, no DNS.
/// 2. Explicit port: A/AAAA only.
/// 3. NAPTR, unless a transport was pinned by the URI.
/// 4. SRV for each allowed transport.
/// 5. A/AAAA with the scheme's default port.
///
/// CNAMEs are followed at every step. The returned candidates are
/// de-duplicated and ranked, `priority` 0 being the most preferred.
#[derive(Clone)]
pub struct SipResolver {
    dns: Arc<dyn DnsLookup>,
    use_naptr: bool,
    use_srv: bool,
    transports: Vec<TransportKind>,
}

impl SipResolver {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        Self {
            dns,
            use_naptr: true,
            use_srv: true,
            transports: vec![TransportKind::Udp, TransportKind::Tcp],
        }
    }

    /// Creates a resolver using system DNS configuration.
    pub fn from_system() -> Self {
        Self::new(Arc::new(TrustDnsLookup::from_system()))
    }

    pub fn with_naptr(mut self, enabled: bool) -> Self {
        self.use_naptr = enabled;
        self
    }

    pub fn with_srv(mut self, enabled: bool) -> Self {
        self.use_srv = enabled;
        self
    }

    /// Transports tried for `sip:` URIs without a `transport` parameter, in
    /// preference order. Defaults to UDP then TCP.
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        if !transports.is_empty() {
            self.transports = transports;
        }
        self
    }

    /// Transports the URI permits, in preference order, and whether the URI
    /// pinned one explicitly.
    fn allowed_transports(
        &self,
        uri: &SipUri,
    ) -> Result<(Vec<TransportKind>, bool), ResolveError> {
        match uri.transport_param() {
            Some(param) => {
                let kind = match (uri.sips, TransportKind::parse(&param)) {
                    (false, Some(kind)) => kind,
                    // sips over TCP means TLS.
                    (true, Some(TransportKind::Tcp | TransportKind::Tls)) => TransportKind::Tls,
                    _ => {
                        return Err(ResolveError::InvalidTarget(format!(
                            "unsupported transport {param} for {uri}"
                        )))
                    }
                };
                Ok((vec![kind], true))
            }
            None if uri.sips => Ok((vec![TransportKind::Tls], false)),
            None => Ok((self.transports.clone(), false)),
        }
    }

    /// Queries `name`, chasing CNAMEs until records of `kind` appear.
    async fn query_following(
        &self,
        name: &str,
        kind: RecordKind,
    ) -> Result<Vec<DnsRecord>, ResolveError> {
        let mut current = normalize_name(name);
        let mut seen = HashSet::new();
        for _ in 0..=MAX_CNAME_CHAIN {
            if !seen.insert(current.clone()) {
                warn!(name = %current, "CNAME loop");
                return Err(ResolveError::TooManyCnames(normalize_name(name)));
            }
            let records = match self.dns.query(&current, kind).await {
                Ok(records) => records,
                Err(e) => {
                    debug!(name = %current, %kind, error = %e, "dns query failed");
                    return Err(e.into());
                }
            };

            let wanted: Vec<DnsRecord> = records
                .iter()
                .filter(|r| matches_kind(r, kind))
                .cloned()
                .collect();
            if !wanted.is_empty() {
                return Ok(wanted);
            }
            match records.into_iter().find_map(|r| match r {
                DnsRecord::Cname(target) => Some(target),
                _ => None,
            }) {
                Some(target) => {
                    debug!(alias = %current, %target, "following CNAME");
                    current = target;
                }
                None => {
                    return Err(DnsError::NoRecords { name: current, kind }.into());
                }
            }
        }
        warn!(name, "CNAME chain too long");
        Err(ResolveError::TooManyCnames(normalize_name(name)))
    }

    /// Performs A and AAAA lookup with Happy Eyeballs ordering.
    async fn lookup_a_aaaa(&self, host: &str) -> Vec<IpAddr> {
        let v6 = self.addresses(host, RecordKind::Aaaa).await;
        let v4 = self.addresses(host, RecordKind::A).await;

        let mut result = Vec::with_capacity(v6.len() + v4.len());
        for i in 0..v6.len().max(v4.len()) {
            if let Some(ip) = v6.get(i) {
                result.push(*ip);
            }
            if let Some(ip) = v4.get(i) {
                result.push(*ip);
            }
        }
        result
    }

    async fn addresses(&self, host: &str, kind: RecordKind) -> Vec<IpAddr> {
        match self.query_following(host, kind).await {
            Ok(records) => records
                .into_iter()
                .filter_map(|r| match r {
                    DnsRecord::A(v4) => Some(IpAddr::V4(v4)),
                    DnsRecord::Aaaa(v6) => Some(IpAddr::V6(v6)),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                debug!(host, %kind, error = %e, "no addresses");
                Vec::new()
            }
        }
    }

    /// Performs NAPTR lookup per RFC 3263 §4.1, keeping only usable records.
    async fn lookup_naptr(&self, host: &str, allowed: &[TransportKind]) -> Vec<NaptrRecord> {
        let records = match self.query_following(host, RecordKind::Naptr).await {
            Ok(records) => records,
            Err(e) => {
                debug!(host, error = %e, "no NAPTR records");
                return Vec::new();
            }
        };

        let mut parsed: Vec<NaptrRecord> = records
            .into_iter()
            .filter_map(|r| match r {
                DnsRecord::Naptr {
                    order,
                    preference,
                    flags,
                    service,
                    replacement,
                } => {
                    let transport = naptr_transport(&service)?;
                    if !allowed.contains(&transport) {
                        return None;
                    }
                    let srv = match flags.as_str() {
                        "s" => true,
                        "a" => false,
                        _ => return None,
                    };
                    if srv && !self.use_srv {
                        return None;
                    }
                    Some(NaptrRecord {
                        order,
                        preference,
                        transport,
                        srv,
                        replacement,
                    })
                }
                _ => None,
            })
            .collect();
        parsed.sort();
        parsed
    }

    /// Performs SRV lookup per RFC 3263 §4.2 and resolves each target.
    async fn lookup_srv(
        &self,
        srv_name: &str,
        transport: TransportKind,
        host: &SmolStr,
    ) -> Vec<Candidate> {
        let records = match self.query_following(srv_name, RecordKind::Srv).await {
            Ok(records) => records,
            Err(e) => {
                debug!(srv_name, error = %e, "no SRV records");
                return Vec::new();
            }
        };

        // Group by priority (RFC 2782 §3)
        let mut groups: BTreeMap<u16, Vec<(u16, SmolStr, u16)>> = BTreeMap::new();
        for record in records {
            if let DnsRecord::Srv {
                priority,
                weight,
                port,
                target,
            } = record
            {
                // "." means the service is decidedly not available.
                if target.is_empty() {
                    continue;
                }
                groups.entry(priority).or_default().push((weight, target, port));
            }
        }

        let mut candidates = Vec::new();
        for (_, records) in groups {
            for (target, port) in select_by_weight(records) {
                for ip in self.lookup_a_aaaa(&target).await {
                    let addr = SocketAddr::new(ip, port);
                    candidates.push(Candidate::new(transport, addr, host.clone()));
                }
            }
        }
        candidates
    }

    async fn resolve_internal(&self, uri: &SipUri) -> Result<Vec<Candidate>, ResolveError> {
        let (transports, pinned) = self.allowed_transports(uri)?;
        let host = uri.host.clone();

        // RFC 3263 §4: numeric IP bypasses DNS.
        if let Some(ip) = uri.host_ip() {
            let transport = transports.first().copied().unwrap_or(TransportKind::Udp);
            let port = uri.port.unwrap_or(default_port(uri, transport));
            return Ok(vec![Candidate::new(transport, SocketAddr::new(ip, port), host)]);
        }

        // RFC 3263 §4.2: explicit port, A/AAAA only.
        if let Some(port) = uri.port {
            let ips = self.lookup_a_aaaa(&host).await;
            return finish(&host, address_candidates(&transports, &ips, |_| port, &host));
        }

        let mut candidates = Vec::new();

        if self.use_naptr && !pinned {
            for record in self.lookup_naptr(&host, &transports).await {
                if record.srv {
                    let found = self
                        .lookup_srv(&record.replacement, record.transport, &host)
                        .await;
                    candidates.extend(found);
                } else {
                    let port = default_port(uri, record.transport);
                    for ip in self.lookup_a_aaaa(&record.replacement).await {
                        let addr = SocketAddr::new(ip, port);
                        candidates.push(Candidate::new(record.transport, addr, host.clone()));
                    }
                }
            }
        }

        if candidates.is_empty() && self.use_srv {
            for transport in &transports {
                let srv_name = format!("{}.{}", srv_prefix(*transport), host);
                candidates.extend(self.lookup_srv(&srv_name, *transport, &host).await);
            }
        }

        if candidates.is_empty() {
            let ips = self.lookup_a_aaaa(&host).await;
            candidates = address_candidates(&transports, &ips, |t| default_port(uri, t), &host);
        }

        finish(&host, candidates)
    }
}

#[async_trait]
impl Resolver for SipResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Candidate>, ResolveError> {
        self.resolve_internal(uri).await
    }
}

fn matches_kind(record: &DnsRecord, kind: RecordKind) -> bool {
    matches!(
        (record, kind),
        (DnsRecord::A(_), RecordKind::A)
            | (DnsRecord::Aaaa(_), RecordKind::Aaaa)
            | (DnsRecord::Naptr { .. }, RecordKind::Naptr)
            | (DnsRecord::Srv { .. }, RecordKind::Srv)
            | (DnsRecord::Cname(_), RecordKind::Cname)
    )
}

fn default_port(uri: &SipUri, transport: TransportKind) -> u16 {
    if uri.sips || transport == TransportKind::Tls {
        sip_core::SIPS_DEFAULT_PORT
    } else {
        sip_core::SIP_DEFAULT_PORT
    }
}

/// One candidate per (transport, address), transport-major.
fn address_candidates(
    transports: &[TransportKind],
    ips: &[IpAddr],
    port: impl Fn(TransportKind) -> u16,
    host: &SmolStr,
) -> Vec<Candidate> {
    transports
        .iter()
        .flat_map(|t| {
            ips.iter()
                .map(|ip| Candidate::new(*t, SocketAddr::new(*ip, port(*t)), host.clone()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Removes duplicates, assigns ranks, and fails on an empty list.
fn finish(host: &SmolStr, candidates: Vec<Candidate>) -> Result<Vec<Candidate>, ResolveError> {
    let mut seen = HashSet::new();
    let ranked: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.key()))
        .enumerate()
        .map(|(rank, c)| c.with_priority(rank.min(u16::MAX as usize) as u16))
        .collect();
    if ranked.is_empty() {
        Err(ResolveError::Unresolvable(host.clone()))
    } else {
        debug!(%host, count = ranked.len(), "resolved candidates");
        Ok(ranked)
    }
}

/// Orders SRV targets of one priority group by weight per RFC 2782.
///
/// Repeatedly draws a target with probability proportional to its weight
/// and removes it from the pool.
fn select_by_weight(mut records: Vec<(u16, SmolStr, u16)>) -> Vec<(SmolStr, u16)> {
    let mut rng = rand::thread_rng();
    let mut result = Vec::with_capacity(records.len());

    while !records.is_empty() {
        let total_weight: u32 = records.iter().map(|(w, _, _)| *w as u32).sum();
        let idx = if total_weight == 0 {
            rng.gen_range(0..records.len())
        } else {
            let pick = rng.gen_range(0..total_weight);
            let mut cumulative = 0u32;
            records
                .iter()
                .position(|(w, _, _)| {
                    cumulative += *w as u32;
                    cumulative > pick
                })
                .unwrap_or(0)
        };
        let (_, host, port) = records.remove(idx);
        result.push((host, port));
    }
    result
}
