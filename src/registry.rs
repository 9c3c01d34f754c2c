// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::path;

/// The callback kinds a registration can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Watch,
    WatchTree,
    Validate,
    Provide,
    Refresh,
    Index,
    Proxy,
}

const KIND_COUNT: usize = 7;

impl Kind {
    fn idx(self) -> usize {
        match self {
            Kind::Watch => 0,
            Kind::WatchTree => 1,
            Kind::Validate => 2,
            Kind::Provide => 3,
            Kind::Refresh => 4,
            Kind::Index => 5,
            Kind::Proxy => 6,
        }
    }
}

/// Per-registration invocation statistics, microseconds.
#[derive(Default)]
pub struct Stats {
    pub count: AtomicU64,
    pub min_us: AtomicU64,
    pub max_us: AtomicU64,
    pub total_us: AtomicU64,
}

impl Stats {
    pub fn record(&self, elapsed_us: u64) {
        let n = self.count.fetch_add(1, Ordering::Relaxed);
        if n == 0 {
            self.min_us.store(elapsed_us, Ordering::Relaxed);
        } else {
            self.min_us.fetch_min(elapsed_us, Ordering::Relaxed);
        }
        self.max_us.fetch_max(elapsed_us, Ordering::Relaxed);
        self.total_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    /// `"count,min,avg,max"` as published under `/apteryx/statistics/`.
    pub fn render(&self) -> String {
        let count = self.count.load(Ordering::Relaxed);
        let avg = if count == 0 {
            0
        } else {
            self.total_us.load(Ordering::Relaxed) / count
        };
        format!(
            "{},{},{},{}",
            count,
            self.min_us.load(Ordering::Relaxed),
            avg,
            self.max_us.load(Ordering::Relaxed)
        )
    }
}

/// One callback registration. Shared by `Arc`; a dispatch in flight keeps
/// the record alive after it leaves the registry.
pub struct Record {
    pub guid: String,
    pub kind: Kind,
    pub pattern: String,
    /// Remote instance for proxy records.
    pub uri: Option<String>,
    pub pid: u32,
    pub handle: u64,
    seq: u64,
    wilds: u32,
    depth: u32,
    pub stats: Stats,
    pub disabled: AtomicBool,
}

impl Record {
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }
}

/// 32-bit FNV-1a over the registration content, the third GUID field.
pub fn content_hash(pattern: &str, uri: Option<&str>) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for b in pattern.bytes().chain(uri.unwrap_or("").bytes()) {
        h ^= b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

/// `pid-handle-hash`, all hex. The unique identity of a registration.
pub fn format_guid(pid: u32, handle: u64, hash: u32) -> String {
    format!("{:x}-{:x}-{:x}", pid, handle, hash)
}

pub fn parse_guid(guid: &str) -> Option<(u32, u64, u32)> {
    let mut it = guid.split('-');
    let pid = u32::from_str_radix(it.next()?, 16).ok()?;
    let handle = u64::from_str_radix(it.next()?, 16).ok()?;
    let hash = u32::from_str_radix(it.next()?, 16).ok()?;
    if it.next().is_some() {
        return None;
    }
    Some((pid, handle, hash))
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// The interior `*` slot: matches exactly one segment.
    wild: Option<Box<TrieNode>>,
    /// Patterns ending exactly here.
    here: Vec<Arc<Record>>,
    /// Patterns with a trailing `/`: match exactly one segment below here.
    one_level: Vec<Arc<Record>>,
    /// Patterns with a trailing `*` segment: match everything below here.
    subtree: Vec<Arc<Record>>,
}

impl TrieNode {
    fn descend(&mut self, segs: &[&str]) -> &mut TrieNode {
        let mut node = self;
        for seg in segs {
            node = if *seg == "*" {
                node.wild.get_or_insert_with(Default::default)
            } else {
                node.children.entry(seg.to_string()).or_default()
            };
        }
        node
    }

    fn match_into(&self, segs: &[&str], out: &mut Vec<Arc<Record>>) {
        if !segs.is_empty() {
            out.extend(self.subtree.iter().cloned());
        }
        if segs.len() == 1 {
            out.extend(self.one_level.iter().cloned());
        }
        if segs.is_empty() {
            out.extend(self.here.iter().cloned());
            return;
        }
        if let Some(child) = self.children.get(segs[0]) {
            child.match_into(&segs[1..], out);
        }
        if let Some(wild) = &self.wild {
            wild.match_into(&segs[1..], out);
        }
    }

    fn search_into(&self, segs: &[&str], out: &mut Vec<Arc<Record>>) {
        out.extend(self.subtree.iter().cloned());
        if segs.is_empty() {
            out.extend(self.one_level.iter().cloned());
            self.collect_below(out);
            return;
        }
        if let Some(child) = self.children.get(segs[0]) {
            child.search_into(&segs[1..], out);
        }
        if let Some(wild) = &self.wild {
            wild.search_into(&segs[1..], out);
        }
    }

    fn collect_below(&self, out: &mut Vec<Arc<Record>>) {
        for node in self.children.values().chain(self.wild.as_deref()) {
            out.extend(node.here.iter().cloned());
            out.extend(node.one_level.iter().cloned());
            out.extend(node.subtree.iter().cloned());
            node.collect_below(out);
        }
    }

    fn remove(&mut self, guid: &str) {
        self.here.retain(|r| r.guid != guid);
        self.one_level.retain(|r| r.guid != guid);
        self.subtree.retain(|r| r.guid != guid);
        for child in self.children.values_mut() {
            child.remove(guid);
        }
        if let Some(wild) = &mut self.wild {
            wild.remove(guid);
        }
        self.children.retain(|_, c| !c.is_empty());
        if self.wild.as_ref().is_some_and(|w| w.is_empty()) {
            self.wild = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.here.is_empty()
            && self.one_level.is_empty()
            && self.subtree.is_empty()
            && self.children.is_empty()
            && self.wild.is_none()
    }
}

/// The callback registry: one pattern trie per kind plus a flat GUID index.
pub struct Registry {
    tries: [RwLock<TrieNode>; KIND_COUNT],
    by_guid: DashMap<String, Arc<Record>>,
    seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            tries: Default::default(),
            by_guid: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Inserts a registration. Replaces any prior record with the same GUID
    /// (re-registration with a changed pattern gets a new GUID anyway, the
    /// hash field covers the content).
    pub fn insert(
        &self,
        kind: Kind,
        pattern: &str,
        uri: Option<String>,
        pid: u32,
        handle: u64,
    ) -> Arc<Record> {
        let hash = content_hash(pattern, uri.as_deref());
        let guid = format_guid(pid, handle, hash);
        let one_level = pattern.len() > 1 && pattern.ends_with('/');
        let segs: Vec<&str> = path::segments(pattern).collect();
        let trailing_wild = !one_level && segs.last() == Some(&"*");
        let anchor = if trailing_wild {
            &segs[..segs.len() - 1]
        } else {
            &segs[..]
        };
        let wilds = segs.iter().filter(|s| **s == "*").count() as u32
            + if one_level { 1 } else { 0 };
        let depth = segs.iter().filter(|s| **s != "*").count() as u32;

        let record = Arc::new(Record {
            guid: guid.clone(),
            kind,
            pattern: pattern.to_string(),
            uri,
            pid,
            handle,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            wilds,
            depth,
            stats: Stats::default(),
            disabled: AtomicBool::new(false),
        });

        self.remove(&guid);
        let mut trie = self.tries[kind.idx()].write();
        let node = trie.descend(anchor);
        if one_level {
            node.one_level.push(record.clone());
        } else if trailing_wild {
            node.subtree.push(record.clone());
        } else {
            node.here.push(record.clone());
        }
        drop(trie);
        self.by_guid.insert(guid, record.clone());
        record
    }

    pub fn remove(&self, guid: &str) -> Option<Arc<Record>> {
        let (_, record) = self.by_guid.remove(guid)?;
        self.tries[record.kind.idx()].write().remove(guid);
        Some(record)
    }

    pub fn lookup(&self, guid: &str) -> Option<Arc<Record>> {
        self.by_guid.get(guid).map(|r| r.value().clone())
    }

    /// All enabled records of `kind` whose pattern matches `path`, most
    /// specific first (fewer wildcards, deeper literal anchors, then
    /// registration order).
    pub fn match_(&self, kind: Kind, path: &str) -> Vec<Arc<Record>> {
        let segs: Vec<&str> = path::segments(path).collect();
        let mut out = Vec::new();
        self.tries[kind.idx()].read().match_into(&segs, &mut out);
        out.retain(|r| !r.is_disabled());
        out.sort_by_key(|r| (r.wilds, std::cmp::Reverse(r.depth), r.seq));
        out
    }

    /// All enabled records of `kind` whose pattern could name a path below
    /// `prefix`.
    pub fn search(&self, kind: Kind, prefix: &str) -> Vec<Arc<Record>> {
        let segs: Vec<&str> = path::segments(prefix).collect();
        let mut out = Vec::new();
        self.tries[kind.idx()].read().search_into(&segs, &mut out);
        out.retain(|r| !r.is_disabled());
        out.sort_by_key(|r| (r.wilds, std::cmp::Reverse(r.depth), r.seq));
        out
    }

    /// Cheap predicate form of `search`, used to decide whether a read even
    /// needs to consult indexers/providers/refreshers.
    pub fn exists(&self, kind: Kind, prefix: &str) -> bool {
        !self.search(kind, prefix).is_empty()
    }

    /// Snapshot of every live registration, for the statistics surface.
    pub fn records(&self) -> Vec<Arc<Record>> {
        self.by_guid.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_guid.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(r: &Registry, kind: Kind, pattern: &str) -> Arc<Record> {
        let handle = r.seq.load(Ordering::Relaxed) + 100;
        r.insert(kind, pattern, None, 42, handle)
    }

    #[test]
    fn test_guid_round_trip() {
        let g = format_guid(0x1234, 0xdeadbeef, 0xcafe);
        assert_eq!(parse_guid(&g), Some((0x1234, 0xdeadbeef, 0xcafe)));
        assert_eq!(parse_guid("zz-1-2"), None);
        assert_eq!(parse_guid("1-2"), None);
    }

    #[test]
    fn test_exact_match() {
        let r = Registry::new();
        reg(&r, Kind::Watch, "/a/b");
        assert_eq!(r.match_(Kind::Watch, "/a/b").len(), 1);
        assert!(r.match_(Kind::Watch, "/a").is_empty());
        assert!(r.match_(Kind::Watch, "/a/b/c").is_empty());
        assert!(r.match_(Kind::Validate, "/a/b").is_empty());
    }

    #[test]
    fn test_wildcard_match() {
        let r = Registry::new();
        reg(&r, Kind::Watch, "/a/*/c");
        assert_eq!(r.match_(Kind::Watch, "/a/x/c").len(), 1);
        assert!(r.match_(Kind::Watch, "/a/x/d").is_empty());
        reg(&r, Kind::Watch, "/z/*");
        assert_eq!(r.match_(Kind::Watch, "/z/one").len(), 1);
        assert_eq!(r.match_(Kind::Watch, "/z/one/two/three").len(), 1);
        assert!(r.match_(Kind::Watch, "/z").is_empty());
        reg(&r, Kind::Watch, "/w/");
        assert_eq!(r.match_(Kind::Watch, "/w/one").len(), 1);
        assert!(r.match_(Kind::Watch, "/w/one/two").is_empty());
    }

    #[test]
    fn test_match_most_specific_first() {
        let r = Registry::new();
        let wide = reg(&r, Kind::Provide, "/a/*");
        let narrow = reg(&r, Kind::Provide, "/a/b/c");
        let mid = reg(&r, Kind::Provide, "/a/*/c");
        let got = r.match_(Kind::Provide, "/a/b/c");
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].guid, narrow.guid);
        assert_eq!(got[1].guid, mid.guid);
        assert_eq!(got[2].guid, wide.guid);
    }

    #[test]
    fn test_search_covers_descendants() {
        let r = Registry::new();
        reg(&r, Kind::Index, "/if/*");
        reg(&r, Kind::Index, "/if/eth0/state");
        reg(&r, Kind::Index, "/other/x");
        let got = r.search(Kind::Index, "/if");
        assert_eq!(got.len(), 2);
        assert!(r.exists(Kind::Index, "/if"));
        assert!(r.exists(Kind::Index, "/if/eth0"));
        assert!(!r.exists(Kind::Index, "/none"));
    }

    #[test]
    fn test_remove_and_disable() {
        let r = Registry::new();
        let rec = reg(&r, Kind::Watch, "/a/*");
        assert_eq!(r.match_(Kind::Watch, "/a/b").len(), 1);
        rec.disabled.store(true, Ordering::Relaxed);
        assert!(r.match_(Kind::Watch, "/a/b").is_empty());
        rec.disabled.store(false, Ordering::Relaxed);
        assert!(r.remove(&rec.guid).is_some());
        assert!(r.match_(Kind::Watch, "/a/b").is_empty());
        assert!(r.is_empty());
        // the in-flight Arc still works after removal
        assert_eq!(rec.pattern, "/a/*");
    }

    #[test]
    fn test_stats_render() {
        let s = Stats::default();
        assert_eq!(s.render(), "0,0,0,0");
        s.record(10);
        s.record(30);
        assert_eq!(s.render(), "2,10,20,30");
    }
}
