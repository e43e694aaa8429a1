// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use sip_observe::dispatch_metrics;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{Candidate, TransportKind};

/// Identity of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

impl PoolKey {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }
}

/// Why a candidate could not be connected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection to {0} refused")]
    Refused(SocketAddr),
    #[error("connection to {0} timed out")]
    TimedOut(SocketAddr),
    #[error("{0} is not supported by this connector")]
    Unsupported(TransportKind),
    #[error("connect failed: {0}")]
    Io(String),
}

impl ConnectError {
    /// Low-cardinality label for metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            ConnectError::Refused(_) => "refused",
            ConnectError::TimedOut(_) => "timeout",
            ConnectError::Unsupported(_) => "unsupported",
            ConnectError::Io(_) => "connect",
        }
    }
}

/// Why bytes could not be handed to a connection.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("connection write queue full")]
    Busy,
}

/// Handle to an established (or, for UDP, bound) path to one peer.
///
/// Cloning is cheap; every clone feeds the same writer task. The writer task
/// and its socket go away once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    key: PoolKey,
    writer: mpsc::Sender<Bytes>,
}

impl Connection {
    pub fn new(transport: TransportKind, peer: SocketAddr, writer: mpsc::Sender<Bytes>) -> Self {
        Self {
            key: PoolKey::new(transport, peer),
            writer,
        }
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn transport(&self) -> TransportKind {
        self.key.transport
    }

    pub fn peer(&self) -> SocketAddr {
        self.key.addr
    }

    /// Queues bytes for the writer task without waiting.
    pub fn send(&self, payload: Bytes) -> Result<(), SendError> {
        match self.writer.try_send(payload) {
            Ok(()) => {
                dispatch_metrics().on_packet_sent(self.key.transport.as_str());
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(SendError::Busy),
            Err(TrySendError::Closed(_)) => {
                dispatch_metrics().on_error(self.key.transport.as_str(), "write");
                Err(SendError::Closed)
            }
        }
    }

    /// True once the writer task has exited (peer closed, write error).
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }
}

/// Establishes connections for candidates.
///
/// UDP "connects" succeed immediately. TCP and TLS must report a peer that
/// actively refuses with [`ConnectError::Refused`] and one that never answers
/// with [`ConnectError::TimedOut`]; callers may also bound the call with their
/// own timeout.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, candidate: &Candidate) -> Result<Connection, ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    #[tokio::test]
    async fn send_reaches_writer_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Connection::new(TransportKind::Udp, peer(), tx);
        conn.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"ping");
        assert_eq!(conn.key(), PoolKey::new(TransportKind::Udp, peer()));
    }

    #[test]
    fn send_reports_closed_and_busy() {
        let (tx, rx) = mpsc::channel(1);
        let conn = Connection::new(TransportKind::Tcp, peer(), tx);
        conn.send(Bytes::from_static(b"a")).unwrap();
        assert_eq!(conn.send(Bytes::from_static(b"b")), Err(SendError::Busy));
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(conn.send(Bytes::from_static(b"c")), Err(SendError::Closed));
    }

    #[test]
    fn connect_error_stages() {
        assert_eq!(ConnectError::Refused(peer()).stage(), "refused");
        assert_eq!(ConnectError::TimedOut(peer()).stage(), "timeout");
        assert_eq!(
            ConnectError::Unsupported(TransportKind::Tls).to_string(),
            "tls is not supported by this connector"
        );
    }
}
