// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::{Connection, PoolKey};

/// Maximum number of pooled connections (prevents file descriptor exhaustion).
pub const MAX_POOL_SIZE: usize = 1000;

/// Idle timeout for pooled connections.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection entry with activity tracking for eviction.
#[derive(Debug, Clone)]
struct PoolEntry {
    connection: Connection,
    last_used: Instant,
}

impl PoolEntry {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_used: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() > timeout
    }
}

/// Established connections keyed by (transport, address).
///
/// Only successful connects are inserted. A destination that failed to
/// connect is never in here, so a lookup miss always means "attempt".
#[derive(Debug)]
pub struct ConnectionPool {
    entries: DashMap<PoolKey, PoolEntry>,
    max_size: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_limits(MAX_POOL_SIZE, IDLE_TIMEOUT)
    }

    /// Creates a new pool with custom limits.
    pub fn with_limits(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a live pooled connection, evicting it if its writer is gone.
    pub fn get(&self, key: &PoolKey) -> Option<Connection> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.connection.is_closed() {
            drop(entry);
            debug!(transport = %key.transport, peer = %key.addr, "evicting closed connection");
            self.entries.remove(key);
            return None;
        }
        entry.touch();
        Some(entry.connection.clone())
    }

    /// Registers an established connection, replacing any previous one for
    /// the same key.
    pub fn insert(&self, connection: Connection) {
        let key = connection.key();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.cleanup_idle();
            if self.entries.len() >= self.max_size {
                self.evict_lru();
            }
        }
        debug!(transport = %key.transport, peer = %key.addr, "pooling connection");
        self.entries.insert(key, PoolEntry::new(connection));
    }

    /// Drops the pooled connection for `key`. The socket closes once no
    /// transaction holds a clone any more.
    pub fn close(&self, key: &PoolKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Removes idle and closed connections. Called on insert at capacity;
    /// long-lived owners should also call it periodically.
    pub fn cleanup_idle(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if entry.is_idle(self.idle_timeout) || entry.connection.is_closed() {
                debug!(transport = %key.transport, peer = %key.addr, "removing idle connection");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Evicts the least recently used tenth of the pool.
    fn evict_lru(&self) {
        let evict_count = (self.max_size / 10).max(1);

        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_used))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);

        for (key, _) in entries.iter().take(evict_count) {
            debug!(transport = %key.transport, peer = %key.addr, "evicting LRU connection");
            self.entries.remove(key);
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
