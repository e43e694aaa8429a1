// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;

use sip_core::Response;
use thiserror::Error;

use crate::TransactionKey;

/// A live transaction already uses this key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("client transaction {0} already registered")]
pub struct DuplicateKey(pub TransactionKey);

/// Live client transactions keyed by branch and method.
///
/// Owned by the agent task, so it needs no locking. A key may be registered
/// again once its previous owner has been unregistered.
#[derive(Debug)]
pub struct OutgoingRegistry<T> {
    entries: HashMap<TransactionKey, T>,
}

impl<T> Default for OutgoingRegistry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> OutgoingRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: TransactionKey, transaction: T) -> Result<(), DuplicateKey> {
        if self.entries.contains_key(&key) {
            return Err(DuplicateKey(key));
        }
        self.entries.insert(key, transaction);
        Ok(())
    }

    /// Finds the transaction a response belongs to.
    pub fn lookup(&self, response: &Response) -> Option<&T> {
        let key = TransactionKey::from_response(response)?;
        self.entries.get(&key)
    }

    /// Key of the live transaction a response belongs to.
    pub fn lookup_key(&self, response: &Response) -> Option<TransactionKey> {
        let key = TransactionKey::from_response(response)?;
        self.entries.contains_key(&key).then_some(key)
    }

    pub fn get(&self, key: &TransactionKey) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &TransactionKey) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    pub fn unregister(&mut self, key: &TransactionKey) -> Option<T> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TransactionKey> {
        self.entries.keys()
    }

    /// Removes every transaction.
    pub fn drain(&mut self) -> impl Iterator<Item = (TransactionKey, T)> + '_ {
        self.entries.drain()
    }
}
