// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::doc::TreeDoc;

/// Notified after a write with the path and the stamped value (empty on
/// delete).
pub type WatchFn = dyn Fn(&str, &Bytes) + Send + Sync;
/// Notified once per multi-path event with the applied document.
pub type WatchTreeFn = dyn Fn(&TreeDoc) + Send + Sync;
/// Vets a pending write; non-zero return refuses the whole operation with
/// that code.
pub type ValidateFn = dyn Fn(&str, &Bytes) -> i32 + Send + Sync;
/// Synthesizes a value for a path with no stored entry.
pub type ProvideFn = dyn Fn(&str) -> Option<Bytes> + Send + Sync;
/// Enumerates dynamic children of a prefix as full paths.
pub type IndexFn = dyn Fn(&str) -> Vec<String> + Send + Sync;
/// Repopulates a stale subtree (by calling back into `set`) and returns how
/// long the written values stay fresh, in microseconds. 0 means always
/// stale.
pub type RefreshFn = dyn Fn(&str) -> u64 + Send + Sync;

/// A registered callback target. Callback records carry an opaque 64-bit
/// handle; this enum is what the handle resolves to in this process.
#[derive(Clone)]
pub enum Callback {
    Watch(Arc<WatchFn>),
    WatchTree(Arc<WatchTreeFn>),
    Validate(Arc<ValidateFn>),
    Provide(Arc<ProvideFn>),
    Index(Arc<IndexFn>),
    Refresh(Arc<RefreshFn>),
}

/// Process-local table mapping callback handles to closures. Handles are
/// never reused within a process lifetime, so a stale GUID can only miss,
/// not alias.
#[derive(Default)]
pub struct HandleTable {
    next: AtomicU64,
    table: RwLock<HashMap<u64, Callback>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next: AtomicU64::new(1),
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, cb: Callback) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.table.write().insert(id, cb);
        id
    }

    pub fn get(&self, id: u64) -> Option<Callback> {
        self.table.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Callback> {
        self.table.write().remove(&id)
    }
}
