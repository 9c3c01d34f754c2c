// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::client::{ClientPool, DEFAULT_RPC_TIMEOUT};
use crate::dispatch::{self, Batch, Dispatcher, Origin, DEFAULT_CALLBACK_TIMEOUT, DEFAULT_WORKERS, LOCAL_ORIGIN};
use crate::doc::TreeDoc;
use crate::handles::{Callback, HandleTable};
use crate::metrics;
use crate::path;
use crate::refresh::RefreshLedger;
use crate::registry::{content_hash, format_guid, Kind, Record, Registry};
use crate::selfconfig;
use crate::status::Status;
use crate::tree::Tree;

/// Microseconds since epoch.
pub fn wall_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub struct StoreOptions {
    pub workers: usize,
    pub callback_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            workers: DEFAULT_WORKERS,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Plain operation counters, served read-only under `/apteryx/counters/`.
#[derive(Default)]
pub struct Counters {
    pub set: AtomicU64,
    pub get: AtomicU64,
    pub search: AtomicU64,
    pub traverse: AtomicU64,
    pub query: AtomicU64,
    pub find: AtomicU64,
    pub prune: AtomicU64,
    pub timestamp: AtomicU64,
    pub memuse: AtomicU64,
    pub watchers_fired: AtomicU64,
    pub validators_run: AtomicU64,
    pub providers_run: AtomicU64,
    pub refreshers_run: AtomicU64,
    pub indexers_run: AtomicU64,
}

impl Counters {
    pub const NAMES: &'static [&'static str] = &[
        "set",
        "get",
        "search",
        "traverse",
        "query",
        "find",
        "prune",
        "timestamp",
        "memuse",
        "watchers_fired",
        "validators_run",
        "providers_run",
        "refreshers_run",
        "indexers_run",
    ];

    pub fn lookup(&self, name: &str) -> Option<u64> {
        let v = match name {
            "set" => &self.set,
            "get" => &self.get,
            "search" => &self.search,
            "traverse" => &self.traverse,
            "query" => &self.query,
            "find" => &self.find,
            "prune" => &self.prune,
            "timestamp" => &self.timestamp,
            "memuse" => &self.memuse,
            "watchers_fired" => &self.watchers_fired,
            "validators_run" => &self.validators_run,
            "providers_run" => &self.providers_run,
            "refreshers_run" => &self.refreshers_run,
            "indexers_run" => &self.indexers_run,
            _ => return None,
        };
        Some(v.load(Ordering::Relaxed))
    }
}

type Binder = Box<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// The operation engine: composes the path tree, the callback registry and
/// the refresh ledger, and enforces the validate -> apply -> watch ordering
/// for every mutation.
pub struct Store {
    pub(crate) tree: Tree,
    pub(crate) registry: Registry,
    pub(crate) refresh: RefreshLedger,
    pub(crate) handles: HandleTable,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) counters: Counters,
    proxies: ClientPool,
    clock: AtomicU64,
    next_origin: AtomicU64,
    pub(crate) binder: RwLock<Option<Binder>>,
}

static INIT: Once = Once::new();

impl Store {
    pub fn new(options: StoreOptions) -> Arc<Self> {
        // Initialize metrics so they're ready at startup
        INIT.call_once(|| {
            metrics::Metrics::init();
        });
        let store = Arc::new(Store {
            tree: Tree::new(),
            registry: Registry::new(),
            refresh: RefreshLedger::new(),
            handles: HandleTable::new(),
            dispatcher: Dispatcher::new(options.workers, options.callback_timeout),
            counters: Counters::default(),
            proxies: ClientPool::new(options.rpc_timeout),
            clock: AtomicU64::new(0),
            next_origin: AtomicU64::new(LOCAL_ORIGIN + 1),
            binder: RwLock::new(None),
        });
        selfconfig::install_builtins(&store);
        store
    }

    /// Allocates a write timestamp: wall-clock microseconds, bumped by 1 on
    /// collision so distinct writes always stamp strictly increasing.
    fn stamp(&self) -> u64 {
        let wall = wall_now_us();
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = wall.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(p) => prev = p,
            }
        }
    }

    /// A fresh originator identity for an RPC connection.
    pub fn new_origin(&self) -> Origin {
        self.next_origin.fetch_add(1, Ordering::Relaxed)
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn registration_count(&self) -> usize {
        self.registry.len()
    }

    pub fn memuse_total(&self) -> u64 {
        self.tree.memuse(path::ROOT)
    }

    /// Install the listener bind/release hook the self-configuration
    /// surface drives from `/apteryx/sockets/`.
    pub fn set_socket_binder(&self, f: impl Fn(&str, Option<&str>) + Send + Sync + 'static) {
        *self.binder.write() = Some(Box::new(f));
    }

    /// Lets queued callbacks finish, then stops the dispatcher.
    pub fn shutdown(&self, limit: Duration) {
        self.dispatcher.shutdown(limit);
    }

    fn callback_for(&self, record: &Record) -> Option<Callback> {
        if record.pid != std::process::id() {
            log::debug!(
                "registration {} belongs to pid {}, not invokable here",
                record.guid,
                record.pid
            );
            return None;
        }
        let cb = self.handles.get(record.handle);
        if cb.is_none() {
            log::debug!("registration {} has no live handle", record.guid);
        }
        cb
    }

    // ---- mutations ------------------------------------------------------

    pub fn set(&self, origin: Origin, path: &str, value: impl Into<Bytes>) -> Result<(), Status> {
        self.apply(origin, vec![(path.to_string(), value.into())], None, false)
    }

    /// `set` that does not return until every watcher it queued has
    /// completed (or the watcher budget expires).
    pub fn set_wait(
        &self,
        origin: Origin,
        path: &str,
        value: impl Into<Bytes>,
    ) -> Result<(), Status> {
        self.apply(origin, vec![(path.to_string(), value.into())], None, true)
    }

    /// Compare-and-swap on the path's last-modified timestamp. 0 asserts
    /// the path has never been written.
    pub fn cas(
        &self,
        origin: Origin,
        path: &str,
        value: impl Into<Bytes>,
        expected_ts: u64,
    ) -> Result<(), Status> {
        self.apply(
            origin,
            vec![(path.to_string(), value.into())],
            Some(expected_ts),
            false,
        )
    }

    /// Applies every leaf of `doc` as one atomic overlay. All validators
    /// run before any leaf lands; any veto drops the whole batch. With
    /// `expected_ts > 0` the document root's timestamp is CAS-checked.
    pub fn set_tree(
        &self,
        origin: Origin,
        doc: &TreeDoc,
        expected_ts: u64,
        wait: bool,
    ) -> Result<(), Status> {
        let pairs: Vec<(String, Bytes)> = doc
            .leaves()
            .map(|(p, v)| (p.to_string(), v.clone()))
            .collect();
        let cas = (expected_ts > 0).then_some(expected_ts);
        self.apply(origin, pairs, cas, wait)
    }

    pub(crate) fn apply(
        &self,
        origin: Origin,
        pairs: Vec<(String, Bytes)>,
        cas: Option<u64>,
        wait: bool,
    ) -> Result<(), Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["set"])
            .start_timer();
        metrics::REQUEST_COUNT.with_label_values(&["set"]).inc();
        self.counters.set.fetch_add(1, Ordering::Relaxed);

        if pairs.is_empty() {
            return Ok(());
        }
        for (p, _) in &pairs {
            path::validate(p)?;
        }

        // single-path writes inside a proxied subtree go to the remote
        if pairs.len() == 1 {
            if let Some(rec) = self.proxy_for(&pairs[0].0) {
                let uri = rec.uri.clone().unwrap_or_default();
                match self.proxies.set(&uri, pairs.clone(), cas, wait) {
                    Err(Status::Resource) | Err(Status::TimedOut) => {
                        metrics::PROXY_FALLTHROUGH_COUNT
                            .with_label_values(&["set"])
                            .inc();
                        log::debug!("proxy {} unreachable, applying locally", uri);
                    }
                    other => return other,
                }
            }
        }

        // self-configuration paths take effect in-band, before validators,
        // so a registration is live when the writing call returns
        for (p, v) in &pairs {
            if let Some(result) = selfconfig::control_write(self, p, v) {
                result?;
            }
        }

        // validators: synchronous, first non-zero return wins
        for (p, v) in &pairs {
            for rec in self.registry.match_(Kind::Validate, p) {
                let Some(Callback::Validate(f)) = self.callback_for(&rec) else {
                    continue;
                };
                self.counters.validators_run.fetch_add(1, Ordering::Relaxed);
                metrics::CALLBACK_COUNT
                    .with_label_values(&["validate"])
                    .inc();
                let (vp, vv) = (p.clone(), v.clone());
                match self.dispatcher.call(&rec, move || f(&vp, &vv)) {
                    Ok(0) => {}
                    Ok(code) => return Err(Status::Refused(code)),
                    Err(Status::TimedOut) => {
                        metrics::CALLBACK_TIMEOUT_COUNT
                            .with_label_values(&["validate"])
                            .inc();
                        return Err(Status::TimedOut);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let ts = self.stamp();
        {
            let mut root = self.tree.write();
            if let Some(expected) = cas {
                let cas_root = pairs
                    .iter()
                    .skip(1)
                    .fold(pairs[0].0.clone(), |acc, (p, _)| path::common_root(&acc, p));
                if root.timestamp(&cas_root) != expected {
                    return Err(Status::Busy);
                }
            }
            for (p, v) in &pairs {
                let stored = if v.is_empty() { None } else { Some(v.clone()) };
                root.add(p, stored, ts);
            }
        }
        metrics::TREE_MEMUSE_BYTES.set(self.memuse_total() as i64);

        self.fire_watchers(origin, &pairs, wait)
    }

    /// Queues one task per (leaf, matching watcher) plus one tree-shaped
    /// event per matching tree watcher, all under the originator's FIFO
    /// queue, then optionally waits the batch out.
    fn fire_watchers(
        &self,
        origin: Origin,
        leaves: &[(String, Bytes)],
        wait: bool,
    ) -> Result<(), Status> {
        let ctx = dispatch::current_ctx();
        let origin = ctx.as_ref().map(|c| c.origin).unwrap_or(origin);

        let mut tasks: Vec<(Arc<Record>, Box<dyn FnOnce() + Send>)> = Vec::new();
        for (p, v) in leaves {
            for rec in self.registry.match_(Kind::Watch, p) {
                let Some(Callback::Watch(f)) = self.callback_for(&rec) else {
                    continue;
                };
                self.counters.watchers_fired.fetch_add(1, Ordering::Relaxed);
                metrics::CALLBACK_COUNT.with_label_values(&["watch"]).inc();
                let (wp, wv) = (p.clone(), v.clone());
                tasks.push((rec, Box::new(move || f(&wp, &wv))));
            }
        }

        // tree watchers get one event covering all of their matched leaves
        let mut tree_events: Vec<(Arc<Record>, TreeDoc)> = Vec::new();
        for (p, v) in leaves {
            for rec in self.registry.match_(Kind::WatchTree, p) {
                match tree_events.iter_mut().find(|(r, _)| r.guid == rec.guid) {
                    Some((_, doc)) => doc.insert(p.clone(), v.clone()),
                    None => {
                        let mut doc = TreeDoc::new();
                        doc.insert(p.clone(), v.clone());
                        tree_events.push((rec, doc));
                    }
                }
            }
        }
        for (rec, doc) in tree_events {
            let Some(Callback::WatchTree(f)) = self.callback_for(&rec) else {
                continue;
            };
            metrics::CALLBACK_COUNT
                .with_label_values(&["watch_tree"])
                .inc();
            tasks.push((rec, Box::new(move || f(&doc))));
        }

        let task_count = tasks.len();
        let batch = Batch::new(task_count);
        let mut waits_on_self = false;
        for (rec, run) in tasks {
            if wait && ctx.as_ref().is_some_and(|c| c.guid == rec.guid) {
                waits_on_self = true;
            }
            self.dispatcher.enqueue(origin, rec, run, &batch);
        }

        if !wait {
            return Ok(());
        }
        if waits_on_self {
            // a watcher set_waiting its own pattern would deadlock
            return Err(Status::TimedOut);
        }
        let budget = self.dispatcher.timeout() * task_count.max(1) as u32;
        if !batch.wait(budget) {
            return Err(Status::TimedOut);
        }
        Ok(())
    }

    /// Removes the subtree at `path`. Each removed path produces watcher
    /// events carrying the empty value; tree watchers get one event.
    pub fn prune(&self, origin: Origin, path: &str, expected_ts: Option<u64>) -> Result<(), Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["prune"])
            .start_timer();
        metrics::REQUEST_COUNT.with_label_values(&["prune"]).inc();
        self.counters.prune.fetch_add(1, Ordering::Relaxed);
        path::validate(path)?;

        if let Some(rec) = self.proxy_for_prefix(path) {
            let uri = rec.uri.clone().unwrap_or_default();
            match self.proxies.prune(&uri, path, expected_ts.unwrap_or(0)) {
                Err(Status::Resource) | Err(Status::TimedOut) => {
                    metrics::PROXY_FALLTHROUGH_COUNT
                        .with_label_values(&["prune"])
                        .inc();
                }
                other => return other,
            }
        }

        let ts = self.stamp();
        let removed = {
            let mut root = self.tree.write();
            if let Some(expected) = expected_ts {
                if root.timestamp(path) != expected {
                    return Err(Status::Busy);
                }
            }
            root.prune(path, ts)
        };
        metrics::TREE_MEMUSE_BYTES.set(self.memuse_total() as i64);

        let leaves: Vec<(String, Bytes)> = removed
            .into_iter()
            .map(|(p, _prior)| (p, Bytes::new()))
            .collect();
        self.fire_watchers(origin, &leaves, false)
    }

    // ---- reads ----------------------------------------------------------

    /// Read composition: refreshers first, then the stored value, then the
    /// most specific provider. A stored value shadows any provider.
    pub fn get(&self, _origin: Origin, path: &str) -> Result<Option<Bytes>, Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["get"])
            .start_timer();
        metrics::REQUEST_COUNT.with_label_values(&["get"]).inc();
        self.counters.get.fetch_add(1, Ordering::Relaxed);
        path::validate(path)?;

        if let Some(rec) = self.proxy_for(path) {
            let uri = rec.uri.clone().unwrap_or_default();
            match self.proxies.get(&uri, path) {
                Err(Status::Resource) | Err(Status::TimedOut) => {
                    metrics::PROXY_FALLTHROUGH_COUNT
                        .with_label_values(&["get"])
                        .inc();
                }
                other => return other,
            }
        }

        self.invoke_refreshers(path, self.registry.match_(Kind::Refresh, path));

        if let Some(v) = self.tree.get(path) {
            return Ok(Some(v));
        }

        for rec in self.registry.match_(Kind::Provide, path) {
            let Some(Callback::Provide(f)) = self.callback_for(&rec) else {
                continue;
            };
            self.counters.providers_run.fetch_add(1, Ordering::Relaxed);
            metrics::CALLBACK_COUNT
                .with_label_values(&["provide"])
                .inc();
            let p = path.to_string();
            return match self.dispatcher.call(&rec, move || f(&p)) {
                Ok(value) => Ok(value),
                Err(e) => {
                    metrics::CALLBACK_TIMEOUT_COUNT
                        .with_label_values(&["provide"])
                        .inc();
                    log::debug!("provider {} failed: {}", rec.guid, e);
                    Ok(None)
                }
            };
        }
        Ok(None)
    }

    /// Immediate children of `prefix`: stored children merged with indexer
    /// output, deduplicated and segment-sorted. Providers are not walked.
    pub fn search(&self, _origin: Origin, prefix: &str) -> Result<Vec<String>, Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["search"])
            .start_timer();
        metrics::REQUEST_COUNT.with_label_values(&["search"]).inc();
        self.counters.search.fetch_add(1, Ordering::Relaxed);
        let prefix = normalize_prefix(prefix)?;

        if let Some(rec) = self.proxy_for_prefix(prefix) {
            let uri = rec.uri.clone().unwrap_or_default();
            match self.proxies.search(&uri, prefix) {
                Err(Status::Resource) | Err(Status::TimedOut) => {
                    metrics::PROXY_FALLTHROUGH_COUNT
                        .with_label_values(&["search"])
                        .inc();
                }
                other => return other,
            }
        }

        self.invoke_refreshers(prefix, self.registry.search(Kind::Refresh, prefix));

        let mut out: BTreeSet<String> = self.tree.search(prefix).into_iter().collect();
        if self.registry.exists(Kind::Index, prefix) {
            for rec in self.registry.search(Kind::Index, prefix) {
                let Some(Callback::Index(f)) = self.callback_for(&rec) else {
                    continue;
                };
                self.counters.indexers_run.fetch_add(1, Ordering::Relaxed);
                metrics::CALLBACK_COUNT.with_label_values(&["index"]).inc();
                let p = prefix.to_string();
                match self.dispatcher.call(&rec, move || f(&p)) {
                    Ok(paths) => {
                        out.extend(
                            paths
                                .into_iter()
                                .filter(|c| path::parent(c) == Some(prefix)),
                        );
                    }
                    Err(e) => {
                        metrics::CALLBACK_TIMEOUT_COUNT
                            .with_label_values(&["index"])
                            .inc();
                        log::debug!("indexer {} failed: {}", rec.guid, e);
                    }
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Deep copy of the stored subtree at `path`, refreshing covered
    /// subtrees on the way in.
    pub fn traverse(&self, _origin: Origin, path: &str) -> Result<TreeDoc, Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["traverse"])
            .start_timer();
        metrics::REQUEST_COUNT
            .with_label_values(&["traverse"])
            .inc();
        self.counters.traverse.fetch_add(1, Ordering::Relaxed);
        let path = normalize_prefix(path)?;

        if let Some(rec) = self.proxy_for_prefix(path) {
            let uri = rec.uri.clone().unwrap_or_default();
            match self.proxies.traverse(&uri, path) {
                Err(Status::Resource) | Err(Status::TimedOut) => {
                    metrics::PROXY_FALLTHROUGH_COUNT
                        .with_label_values(&["traverse"])
                        .inc();
                }
                other => return other,
            }
        }

        self.invoke_refreshers(path, self.registry.search(Kind::Refresh, path));
        self.invoke_refreshers(path, self.registry.match_(Kind::Refresh, path));

        Ok(TreeDoc::from_pairs(self.tree.traverse(path)))
    }

    /// Server-side batch of `search`/`get` composition: `*` segments in the
    /// template expand via `search`, leaves fetch via `get`.
    pub fn query(&self, origin: Origin, template: &TreeDoc) -> Result<TreeDoc, Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["query"])
            .start_timer();
        metrics::REQUEST_COUNT.with_label_values(&["query"]).inc();
        self.counters.query.fetch_add(1, Ordering::Relaxed);

        let mut out = TreeDoc::new();
        for (pattern, _) in template.leaves() {
            path::validate_pattern(pattern)?;
            for concrete in self.expand(origin, pattern)? {
                if let Some(v) = self.get(origin, &concrete)? {
                    out.insert(concrete, v);
                }
            }
        }
        Ok(out)
    }

    /// Concrete expansions of `pattern` whose leaves all equal the expected
    /// values. A single clause with an empty leaf filters on the pattern
    /// path itself and yields matching full paths; otherwise clauses name
    /// leaves relative to the expanded prefix, which is what is returned.
    pub fn find(
        &self,
        origin: Origin,
        pattern: &str,
        clauses: &[(String, Bytes)],
    ) -> Result<Vec<String>, Status> {
        let _timer = metrics::REQUEST_LATENCY
            .with_label_values(&["find"])
            .start_timer();
        metrics::REQUEST_COUNT.with_label_values(&["find"]).inc();
        self.counters.find.fetch_add(1, Ordering::Relaxed);
        path::validate_pattern(pattern)?;

        let mut out = BTreeSet::new();
        for prefix in self.expand(origin, pattern)? {
            let mut all = true;
            for (leaf, expected) in clauses {
                let target = if leaf.is_empty() {
                    prefix.clone()
                } else {
                    let mut t = prefix.clone();
                    for seg in path::segments(leaf) {
                        t = path::join(&t, seg);
                    }
                    t
                };
                if self.get(origin, &target)?.as_ref() != Some(expected) {
                    all = false;
                    break;
                }
            }
            if all && !clauses.is_empty() {
                out.insert(prefix);
            }
        }
        Ok(out.into_iter().collect())
    }

    fn expand(&self, origin: Origin, pattern: &str) -> Result<Vec<String>, Status> {
        let mut acc = vec![path::ROOT.to_string()];
        for seg in path::segments(pattern) {
            let mut next = Vec::new();
            if seg == "*" {
                for p in &acc {
                    next.extend(self.search(origin, p)?);
                }
            } else {
                for p in &acc {
                    next.push(path::join(p, seg));
                }
            }
            acc = next;
        }
        Ok(acc)
    }

    pub fn timestamp(&self, _origin: Origin, path: &str) -> Result<u64, Status> {
        metrics::REQUEST_COUNT
            .with_label_values(&["timestamp"])
            .inc();
        self.counters.timestamp.fetch_add(1, Ordering::Relaxed);
        path::validate(path)?;
        if let Some(rec) = self.proxy_for(path) {
            let uri = rec.uri.clone().unwrap_or_default();
            match self.proxies.timestamp(&uri, path) {
                Err(Status::Resource) | Err(Status::TimedOut) => {
                    metrics::PROXY_FALLTHROUGH_COUNT
                        .with_label_values(&["timestamp"])
                        .inc();
                }
                other => return other,
            }
        }
        Ok(self.tree.timestamp(path))
    }

    pub fn memuse(&self, _origin: Origin, path: &str) -> Result<u64, Status> {
        metrics::REQUEST_COUNT.with_label_values(&["memuse"]).inc();
        self.counters.memuse.fetch_add(1, Ordering::Relaxed);
        path::validate(path)?;
        Ok(self.tree.memuse(path))
    }

    // ---- callback plumbing ----------------------------------------------

    fn proxy_for(&self, path: &str) -> Option<Arc<Record>> {
        self.registry.match_(Kind::Proxy, path).into_iter().next()
    }

    /// Proxy lookup for prefix-scoped operations: a proxy whose pattern
    /// covers paths below `prefix` owns the prefix too.
    fn proxy_for_prefix(&self, prefix: &str) -> Option<Arc<Record>> {
        self.proxy_for(prefix)
            .or_else(|| self.registry.search(Kind::Proxy, prefix).into_iter().next())
    }

    /// Runs every stale refresher covering `prefix`, serialized per
    /// (registration, prefix) so each runs at most once per window.
    fn invoke_refreshers(&self, prefix: &str, records: Vec<Arc<Record>>) {
        for rec in records {
            let Some(Callback::Refresh(f)) = self.callback_for(&rec) else {
                continue;
            };
            let entry = self.refresh.entry(&rec.guid, prefix);
            let mut expires_at = entry.lock();
            let now = wall_now_us();
            if now < *expires_at {
                continue;
            }
            self.counters.refreshers_run.fetch_add(1, Ordering::Relaxed);
            metrics::CALLBACK_COUNT
                .with_label_values(&["refresh"])
                .inc();
            let p = prefix.to_string();
            match self.dispatcher.call(&rec, move || f(&p)) {
                Ok(ttl_us) => *expires_at = now + ttl_us,
                Err(e) => {
                    metrics::CALLBACK_TIMEOUT_COUNT
                        .with_label_values(&["refresh"])
                        .inc();
                    log::debug!("refresher {} failed: {}", rec.guid, e);
                }
            }
        }
    }

    // ---- registration API -----------------------------------------------

    fn register(
        &self,
        control: &str,
        pattern: &str,
        uri: Option<&str>,
        cb: Callback,
    ) -> Result<String, Status> {
        path::validate_pattern(pattern)?;
        let handle = self.handles.insert(cb);
        let guid = format_guid(std::process::id(), handle, content_hash(pattern, uri));
        let value = match uri {
            Some(u) => format!("{}:{}", u, pattern),
            None => pattern.to_string(),
        };
        self.set(
            LOCAL_ORIGIN,
            &format!("{}/{}", control, guid),
            Bytes::from(value),
        )?;
        Ok(guid)
    }

    /// Registers a watcher; the returned GUID deregisters it. Registration
    /// goes through the store itself, under `/apteryx/watchers/`.
    pub fn watch(
        &self,
        pattern: &str,
        f: impl Fn(&str, &Bytes) + Send + Sync + 'static,
    ) -> Result<String, Status> {
        self.register(
            selfconfig::WATCHERS,
            pattern,
            None,
            Callback::Watch(Arc::new(f)),
        )
    }

    /// Tree watchers receive one document per mutation batch instead of one
    /// call per leaf. Library-level registration only.
    pub fn watch_tree(
        &self,
        pattern: &str,
        f: impl Fn(&TreeDoc) + Send + Sync + 'static,
    ) -> Result<String, Status> {
        path::validate_pattern(pattern)?;
        let handle = self.handles.insert(Callback::WatchTree(Arc::new(f)));
        let rec = self
            .registry
            .insert(Kind::WatchTree, pattern, None, std::process::id(), handle);
        metrics::REGISTRATION_COUNT.set(self.registry.len() as i64);
        Ok(rec.guid.clone())
    }

    pub fn validate(
        &self,
        pattern: &str,
        f: impl Fn(&str, &Bytes) -> i32 + Send + Sync + 'static,
    ) -> Result<String, Status> {
        self.register(
            selfconfig::VALIDATORS,
            pattern,
            None,
            Callback::Validate(Arc::new(f)),
        )
    }

    pub fn provide(
        &self,
        pattern: &str,
        f: impl Fn(&str) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Result<String, Status> {
        self.register(
            selfconfig::PROVIDERS,
            pattern,
            None,
            Callback::Provide(Arc::new(f)),
        )
    }

    pub fn index(
        &self,
        pattern: &str,
        f: impl Fn(&str) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<String, Status> {
        self.register(
            selfconfig::INDEXERS,
            pattern,
            None,
            Callback::Index(Arc::new(f)),
        )
    }

    /// Registers a refresher; the closure repopulates its subtree via `set`
    /// and returns how long the result stays fresh, in microseconds.
    pub fn refresh(
        &self,
        pattern: &str,
        f: impl Fn(&str) -> u64 + Send + Sync + 'static,
    ) -> Result<String, Status> {
        self.register(
            selfconfig::REFRESHERS,
            pattern,
            None,
            Callback::Refresh(Arc::new(f)),
        )
    }

    /// Forwards operations under `pattern` to the instance at `uri`.
    pub fn proxy(&self, pattern: &str, uri: &str) -> Result<String, Status> {
        path::validate_pattern(pattern)?;
        crate::wire::parse_uri(uri)?;
        let guid = format_guid(std::process::id(), 0, content_hash(pattern, Some(uri)));
        self.set(
            LOCAL_ORIGIN,
            &format!("{}/{}", selfconfig::PROXIES, guid),
            Bytes::from(format!("{}:{}", uri, pattern)),
        )?;
        Ok(guid)
    }

    /// Destroys a registration of any kind by its GUID.
    pub fn unregister(&self, guid: &str) -> Result<(), Status> {
        let Some(rec) = self.registry.lookup(guid) else {
            return Ok(());
        };
        let control = match rec.kind {
            Kind::Watch => selfconfig::WATCHERS,
            Kind::Validate => selfconfig::VALIDATORS,
            Kind::Provide => selfconfig::PROVIDERS,
            Kind::Refresh => selfconfig::REFRESHERS,
            Kind::Index => selfconfig::INDEXERS,
            Kind::Proxy => selfconfig::PROXIES,
            Kind::WatchTree => {
                self.registry.remove(guid);
                if rec.pid == std::process::id() {
                    self.handles.remove(rec.handle);
                }
                metrics::REGISTRATION_COUNT.set(self.registry.len() as i64);
                return Ok(());
            }
        };
        self.set(LOCAL_ORIGIN, &format!("{}/{}", control, guid), Bytes::new())
    }

    /// A disabled registration is skipped by future dispatches but stays
    /// alive until its last reference drops.
    pub fn set_disabled(&self, guid: &str, disabled: bool) -> bool {
        match self.registry.lookup(guid) {
            Some(rec) => {
                rec.disabled.store(disabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

fn normalize_prefix(prefix: &str) -> Result<&str, Status> {
    let trimmed = if prefix.len() > 1 && prefix.ends_with('/') {
        &prefix[..prefix.len() - 1]
    } else {
        prefix
    };
    path::validate(trimmed)?;
    Ok(trimmed)
}
