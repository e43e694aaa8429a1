// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outbound transport plumbing for the client-transaction dispatcher.
//!
//! - [`Candidate`]: one resolved (transport, address) destination.
//! - [`TransportPolicy`] / [`DefaultTransportPolicy`]: the size-aware
//!   transport selector.
//! - [`Connector`] / [`TokioConnector`]: establishes a [`Connection`] for a
//!   candidate, reporting refused and timed-out connects distinctly.
//! - [`ConnectionPool`]: established connections keyed by
//!   (transport, address) for reuse across transactions.

use std::fmt;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use smol_str::SmolStr;
use thiserror::Error;

pub mod connection;
pub mod connector;
pub mod pool;
pub mod select;

pub use connection::{ConnectError, Connection, Connector, PoolKey, SendError};
pub use connector::TokioConnector;
pub use pool::ConnectionPool;
pub use select::{DefaultTransportPolicy, TransportPolicy, DEFAULT_UDP_MTU};

/// Largest amount of unframed data buffered per stream before the
/// connection is dropped.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024;

/// Transport protocols the dispatcher can send over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns the lowercase transport string for metrics and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    /// Returns the Via header transport token.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Udp.via_transport(), "UDP");
    /// assert_eq!(TransportKind::Tls.via_transport(), "TLS");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Parses a transport token from a Via header or `transport=` parameter.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::parse(" tcp "), Some(TransportKind::Tcp));
    /// assert_eq!(TransportKind::parse("SCTP"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }

    /// TCP and TLS need a connection and give reliable delivery.
    pub fn is_stream_based(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One destination option for sending a request.
///
/// `priority` is the rank assigned by the resolver: lower is preferred and
/// candidates arrive already sorted by it. `host` is the name the address was
/// resolved from and is used as the TLS server name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub transport: TransportKind,
    pub addr: SocketAddr,
    pub host: SmolStr,
    pub priority: u16,
}

impl Candidate {
    pub fn new(transport: TransportKind, addr: SocketAddr, host: impl Into<SmolStr>) -> Self {
        Self {
            transport,
            addr,
            host: host.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn key(&self) -> PoolKey {
        PoolKey::new(self.transport, self.addr)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.addr)
    }
}

/// A message received on a socket owned by a connector.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub payload: Bytes,
}

/// A stream frame that can never be completed within [`MAX_BUFFER_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("declared frame size exceeds the stream buffer limit")]
pub(crate) struct OversizedFrame;

/// Splits buffered stream data into complete SIP messages using
/// `Content-Length`. CRLF keep-alives between messages are discarded.
///
/// Fails when a header block declares a body that would take the frame past
/// [`MAX_BUFFER_SIZE`]; the connection must then be dropped.
pub(crate) fn drain_sip_frames(buf: &mut BytesMut) -> Result<Vec<Bytes>, OversizedFrame> {
    let mut frames = Vec::new();
    loop {
        let leading = buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if leading > 0 {
            let _ = buf.split_to(leading);
        }

        let Some(head_end) = memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") else {
            break;
        };
        let needed = (head_end + 4)
            .checked_add(parse_content_length(&buf[..head_end]).unwrap_or(0))
            .filter(|needed| *needed <= MAX_BUFFER_SIZE)
            .ok_or(OversizedFrame)?;
        if buf.len() < needed {
            break;
        }
        frames.push(buf.split_to(needed).freeze());
    }
    Ok(frames)
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
