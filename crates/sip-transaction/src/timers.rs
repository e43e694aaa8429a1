// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware client timer values per RFC 3261 §17.1.
//!
//! - **Unreliable transports (UDP)**: full values from RFC 3261 Table 4.
//! - **Reliable transports (TCP/TLS)**: retransmission and wait timers are
//!   zero; the transaction timeouts (B and F) stay at 64*T1.
//!
//! # RFC 3261 §17.1.2.2
//!
//! > For unreliable transports (such as UDP), requests are retransmitted at an
//! > exponentially increasing rate until a response is received or the request
//! > times out.  For reliable transports (such as TCP), the request is sent once.
//!
//! ```rust
//! use sip_transaction::timers::TransportAwareTimers;
//! use sip_transaction::TransactionTimer;
//! use sip_transport::TransportKind;
//! use std::time::Duration;
//!
//! let timers = TransportAwareTimers::new(TransportKind::Tcp);
//! assert_eq!(timers.duration(TransactionTimer::E), Duration::ZERO);
//! assert_eq!(timers.duration(TransactionTimer::F), Duration::from_secs(32));
//! assert!(!timers.should_retransmit());
//! ```

use std::time::Duration;

use sip_transport::TransportKind;

use crate::TransactionTimer;

/// Fixed Timer D wait for unreliable transports.
pub const TIMER_D_UNRELIABLE: Duration = Duration::from_secs(32);

/// RFC 3261 base timer values (Table 4).
///
/// T1 should not be set lower than 500ms outside of tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate - default 500ms
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE - default 4s
    pub t2: Duration,
    /// Maximum time a message remains in the network - default 5s
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer value calculator for one client transaction on one transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            defaults: TimerDefaults::default(),
        }
    }

    pub fn with_defaults(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    /// Returns the initial duration for `timer`. Zero means "do not arm".
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_stream_based();
        match timer {
            // Retransmission timers start at T1 and are not used on streams.
            TransactionTimer::A | TransactionTimer::E => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            // Transaction timeouts apply to every transport.
            TransactionTimer::B | TransactionTimer::F => self.defaults.t1.saturating_mul(64),
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    TIMER_D_UNRELIABLE.max(self.defaults.t1.saturating_mul(64))
                }
            }
            TransactionTimer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
        }
    }

    /// Next Timer A interval: doubles without bound (Timer B ends it).
    pub fn next_invite_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2)
    }

    /// Next Timer E interval: doubles, capped at T2.
    pub fn next_non_invite_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.defaults.t2)
    }

    /// Timer E interval once a provisional response has been seen.
    pub fn proceeding_interval(&self) -> Duration {
        self.defaults.t2
    }

    /// Retransmissions are only necessary for unreliable transports.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_stream_based()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }
}
