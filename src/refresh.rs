// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Remembers until when each (registration, prefix) pair is fresh, so reads
/// inside the staleness window skip the refresher entirely.
///
/// The entry value is `expires_at` in microseconds since epoch. Concurrent
/// readers colliding on the same entry serialize on its lock, so the
/// refresher runs at most once per window.
pub struct RefreshLedger {
    entries: DashMap<(String, String), Arc<Mutex<u64>>>,
}

impl RefreshLedger {
    pub fn new() -> Self {
        RefreshLedger {
            entries: DashMap::new(),
        }
    }

    /// The ledger entry for `(guid, prefix)`, created stale if absent.
    /// Callers lock it, re-check expiry, invoke the refresher if stale and
    /// store the new deadline before unlocking.
    pub fn entry(&self, guid: &str, prefix: &str) -> Arc<Mutex<u64>> {
        self.entries
            .entry((guid.to_string(), prefix.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }

    /// Drops every entry belonging to a deregistered refresher.
    pub fn forget(&self, guid: &str) {
        self.entries.retain(|(g, _), _| g != guid);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for RefreshLedger {
    fn default() -> Self {
        Self::new()
    }
}
