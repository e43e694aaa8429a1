// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::Candidate;

/// Payload size above which UDP is avoided when a stream transport exists.
pub const DEFAULT_UDP_MTU: usize = 1300;

/// Decides which of the resolved candidates are worth attempting for a
/// message of the given serialized size.
pub trait TransportPolicy: Send + Sync {
    /// Returns the candidates to attempt, in attempt order. Never returns an
    /// empty list when `candidates` is non-empty.
    fn select(&self, candidates: &[Candidate], payload_len: usize) -> Vec<Candidate>;
}

/// Drops UDP candidates for oversized messages, keeping resolver order.
///
/// When every candidate is UDP the list is returned untouched so the
/// transaction is not stranded.
#[derive(Debug, Clone)]
pub struct DefaultTransportPolicy {
    pub udp_mtu: usize,
}

impl DefaultTransportPolicy {
    pub fn new(udp_mtu: usize) -> Self {
        Self { udp_mtu }
    }
}

impl Default for DefaultTransportPolicy {
    fn default() -> Self {
        Self {
            udp_mtu: DEFAULT_UDP_MTU,
        }
    }
}

impl TransportPolicy for DefaultTransportPolicy {
    fn select(&self, candidates: &[Candidate], payload_len: usize) -> Vec<Candidate> {
        let oversized = payload_len > self.udp_mtu;
        let has_stream = candidates.iter().any(|c| c.transport.is_stream_based());
        if !(oversized && has_stream) {
            return candidates.to_vec();
        }
        candidates
            .iter()
            .filter(|c| c.transport.is_stream_based())
            .cloned()
            .collect()
    }
}
