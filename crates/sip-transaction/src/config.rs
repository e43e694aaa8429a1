// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Agent configuration.
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes. Durations are written as integer milliseconds:
//!
//! ```
//! use sip_transaction::AgentConfig;
//!
//! let config = AgentConfig::from_json_str(r#"{"t1_ms": 250, "udp_mtu": 1400}"#).unwrap();
//! assert_eq!(config.t1.as_millis(), 250);
//! assert_eq!(config.udp_mtu, 1400);
//! assert_eq!(config.max_forwards, 70);
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use sip_core::SipUri;
use sip_transport::DEFAULT_UDP_MTU;
use smol_str::SmolStr;

use crate::timers::TimerDefaults;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(rename = "t1_ms", deserialize_with = "millis")]
    pub t1: Duration,
    #[serde(rename = "t2_ms", deserialize_with = "millis")]
    pub t2: Duration,
    #[serde(rename = "t4_ms", deserialize_with = "millis")]
    pub t4: Duration,
    /// Serialized size above which UDP candidates are skipped.
    pub udp_mtu: usize,
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "dns_timeout_ms", deserialize_with = "millis")]
    pub dns_timeout: Duration,
    /// Outbound proxy used when a transaction names none.
    #[serde(deserialize_with = "optional_uri")]
    pub default_proxy: Option<SipUri>,
    pub use_naptr: bool,
    pub use_srv: bool,
    pub max_client_transactions: usize,
    pub max_forwards: u32,
    /// Host written into the Via, From and Call-ID headers the agent adds.
    pub via_host: SmolStr,
    pub user_agent: Option<SmolStr>,
    pub pool_max_size: usize,
    #[serde(rename = "pool_idle_timeout_ms", deserialize_with = "millis")]
    pub pool_idle_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let timers = TimerDefaults::default();
        Self {
            t1: timers.t1,
            t2: timers.t2,
            t4: timers.t4,
            udp_mtu: DEFAULT_UDP_MTU,
            connect_timeout: Duration::from_secs(4),
            dns_timeout: Duration::from_secs(5),
            default_proxy: None,
            use_naptr: true,
            use_srv: true,
            max_client_transactions: 10_000,
            max_forwards: 70,
            via_host: SmolStr::new("localhost"),
            user_agent: None,
            pool_max_size: 1000,
            pool_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    /// Parses a JSON document, filling missing fields with defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid agent configuration")
    }

    pub fn with_timers(mut self, t1: Duration, t2: Duration, t4: Duration) -> Self {
        self.t1 = t1;
        self.t2 = t2;
        self.t4 = t4;
        self
    }

    pub fn with_udp_mtu(mut self, udp_mtu: usize) -> Self {
        self.udp_mtu = udp_mtu;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    pub fn with_default_proxy(mut self, proxy: SipUri) -> Self {
        self.default_proxy = Some(proxy);
        self
    }

    pub fn with_max_client_transactions(mut self, limit: usize) -> Self {
        self.max_client_transactions = limit;
        self
    }

    pub fn with_pool_limits(mut self, max_size: usize, idle_timeout: Duration) -> Self {
        self.pool_max_size = max_size;
        self.pool_idle_timeout = idle_timeout;
        self
    }

    pub fn with_via_host(mut self, host: impl Into<SmolStr>) -> Self {
        self.via_host = host.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<SmolStr>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn timer_defaults(&self) -> TimerDefaults {
        TimerDefaults {
            t1: self.t1,
            t2: self.t2,
            t4: self.t4,
        }
    }
}

/// Per-transaction overrides.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Send through this proxy instead of the agent default or the Request-URI.
    pub proxy: Option<SipUri>,
}

impl TransactionOptions {
    pub fn via_proxy(proxy: SipUri) -> Self {
        Self { proxy: Some(proxy) }
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_uri<'de, D>(deserializer: D) -> Result<Option<SipUri>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => SipUri::parse(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid SIP URI: {raw}"))),
    }
}
