// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability for the outbound path: connectors report connection and
//! packet events, the transaction agent reports fallbacks, retransmissions
//! and terminal outcomes.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{set_dispatch_metrics, TracingDispatchMetrics};
//! set_dispatch_metrics(Arc::new(TracingDispatchMetrics));
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::Level;

/// Metrics sink for the client side of the stack.
///
/// `transport`, `stage` and `outcome` are low-cardinality labels such as
/// `"tcp"`, `"refused"` or `"503"`. Never feed hostnames or branches in here.
pub trait DispatchMetrics: Send + Sync + 'static {
    fn on_connect(&self, transport: &str);
    fn on_error(&self, transport: &str, stage: &str);
    fn on_packet_sent(&self, transport: &str);
    fn on_packet_received(&self, transport: &str);
    /// A candidate failed and the transaction moved to the next one.
    fn on_fallback(&self, from: &str);
    fn on_retransmit(&self, transport: &str);
    fn on_outcome(&self, outcome: &str);
    fn on_unmatched_response(&self);
}

#[derive(Debug, Default)]
struct NoopDispatchMetrics;

impl DispatchMetrics for NoopDispatchMetrics {
    fn on_connect(&self, _transport: &str) {}
    fn on_error(&self, _transport: &str, _stage: &str) {}
    fn on_packet_sent(&self, _transport: &str) {}
    fn on_packet_received(&self, _transport: &str) {}
    fn on_fallback(&self, _from: &str) {}
    fn on_retransmit(&self, _transport: &str) {}
    fn on_outcome(&self, _outcome: &str) {}
    fn on_unmatched_response(&self) {}
}

static DISPATCH_METRICS: OnceCell<Arc<dyn DispatchMetrics>> = OnceCell::new();
static NOOP_DISPATCH_METRICS: NoopDispatchMetrics = NoopDispatchMetrics;

/// Installs the global metrics implementation.
///
/// Returns `false` if one was already installed.
pub fn set_dispatch_metrics(metrics: Arc<dyn DispatchMetrics>) -> bool {
    DISPATCH_METRICS.set(metrics).is_ok()
}

/// Returns the currently configured metrics sink.
pub fn dispatch_metrics() -> &'static dyn DispatchMetrics {
    DISPATCH_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_DISPATCH_METRICS)
}

/// Span for a single transport operation (connect, send, read loop).
pub fn span_with_transport(op: &'static str, transport: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "transport", op, transport)
}

/// Span wrapping the lifetime of one client transaction.
pub fn span_for_transaction(method: &str, branch: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "client_tx", method, branch)
}

/// Metrics implementation that logs via `tracing`.
#[derive(Debug, Default)]
pub struct TracingDispatchMetrics;

impl DispatchMetrics for TracingDispatchMetrics {
    fn on_connect(&self, transport: &str) {
        tracing::debug!(transport, "connect");
    }

    fn on_error(&self, transport: &str, stage: &str) {
        tracing::warn!(transport, stage, "transport error");
    }

    fn on_packet_sent(&self, transport: &str) {
        tracing::trace!(transport, "packet sent");
    }

    fn on_packet_received(&self, transport: &str) {
        tracing::trace!(transport, "packet received");
    }

    fn on_fallback(&self, from: &str) {
        tracing::debug!(from, "candidate fallback");
    }

    fn on_retransmit(&self, transport: &str) {
        tracing::debug!(transport, "retransmit");
    }

    fn on_outcome(&self, outcome: &str) {
        tracing::debug!(outcome, "client transaction completed");
    }

    fn on_unmatched_response(&self) {
        tracing::debug!("unmatched response");
    }
}

/// In-memory counters keyed by `event:label`, for tests and ad-hoc inspection.
#[derive(Debug, Default)]
pub struct CountingDispatchMetrics {
    counts: DashMap<String, u64>,
}

impl CountingDispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter such as `"fallback:tcp"` or `"outcome:503"`.
    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).map(|v| *v).unwrap_or(0)
    }

    fn bump(&self, event: &str, label: &str) {
        *self.counts.entry(format!("{event}:{label}")).or_insert(0) += 1;
    }
}

impl DispatchMetrics for CountingDispatchMetrics {
    fn on_connect(&self, transport: &str) {
        self.bump("connect", transport);
    }

    fn on_error(&self, transport: &str, stage: &str) {
        self.bump("error", &format!("{transport}/{stage}"));
    }

    fn on_packet_sent(&self, transport: &str) {
        self.bump("sent", transport);
    }

    fn on_packet_received(&self, transport: &str) {
        self.bump("received", transport);
    }

    fn on_fallback(&self, from: &str) {
        self.bump("fallback", from);
    }

    fn on_retransmit(&self, transport: &str) {
        self.bump("retransmit", transport);
    }

    fn on_outcome(&self, outcome: &str) {
        self.bump("outcome", outcome);
    }

    fn on_unmatched_response(&self) {
        self.bump("unmatched", "response");
    }
}
