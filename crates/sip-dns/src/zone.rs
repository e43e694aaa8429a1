// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;

use crate::lookup::{normalize_name, DnsError, DnsLookup, DnsRecord, RecordKind};

/// In-memory DNS zone.
///
/// Records can be added while the zone is shared. A name with a CNAME
/// answers every query with just the CNAME, like an authoritative server
/// that does not chase aliases.
#[derive(Debug, Default)]
pub struct StaticZone {
    records: DashMap<(SmolStr, RecordKind), Vec<DnsRecord>>,
    aliases: DashMap<SmolStr, SmolStr>,
    latency_ms: AtomicU64,
}

impl StaticZone {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, name: &str, kind: RecordKind, record: DnsRecord) -> &Self {
        self.records
            .entry((normalize_name(name), kind))
            .or_default()
            .push(record);
        self
    }

    /// Adds an A or AAAA record depending on the address family.
    pub fn address(&self, name: &str, ip: IpAddr) -> &Self {
        match ip {
            IpAddr::V4(v4) => self.add(name, RecordKind::A, DnsRecord::A(v4)),
            IpAddr::V6(v6) => self.add(name, RecordKind::Aaaa, DnsRecord::Aaaa(v6)),
        }
    }

    pub fn cname(&self, alias: &str, target: &str) -> &Self {
        self.aliases
            .insert(normalize_name(alias), normalize_name(target));
        self
    }

    /// Adds a NAPTR record. `flags` is `"s"` for SRV replacements and `"a"`
    /// for address replacements.
    pub fn naptr(
        &self,
        name: &str,
        order: u16,
        preference: u16,
        flags: &str,
        service: &str,
        replacement: &str,
    ) -> &Self {
        self.add(
            name,
            RecordKind::Naptr,
            DnsRecord::Naptr {
                order,
                preference,
                flags: SmolStr::new(flags.to_ascii_lowercase()),
                service: SmolStr::new(service.to_ascii_uppercase()),
                replacement: normalize_name(replacement),
            },
        )
    }

    pub fn srv(&self, name: &str, priority: u16, weight: u16, port: u16, target: &str) -> &Self {
        self.add(
            name,
            RecordKind::Srv,
            DnsRecord::Srv {
                priority,
                weight,
                port,
                target: normalize_name(target),
            },
        )
    }

    /// Makes every query wait before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    fn answer(&self, name: &str, kind: RecordKind) -> Result<Vec<DnsRecord>, DnsError> {
        let name = normalize_name(name);
        if let Some(target) = self.aliases.get(&name) {
            return Ok(vec![DnsRecord::Cname(target.clone())]);
        }
        if let Some(records) = self.records.get(&(name.clone(), kind)) {
            return Ok(records.clone());
        }
        let known = self.records.iter().any(|entry| entry.key().0 == name);
        if known {
            Err(DnsError::NoRecords { name, kind })
        } else {
            Err(DnsError::NxDomain(name))
        }
    }
}

#[async_trait]
impl DnsLookup for StaticZone {
    async fn query(&self, name: &str, kind: RecordKind) -> Result<Vec<DnsRecord>, DnsError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.answer(name, kind)
    }
}
