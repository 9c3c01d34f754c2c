// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
//! The self-configuration surface: the callback registry mirrored as paths
//! under `/apteryx/`. Clients register and deregister callbacks by writing
//! these paths; the write itself is stored normally afterwards, so the
//! surface is observable through ordinary watchers.

use std::sync::Arc;

use bytes::Bytes;

use crate::dispatch::LOCAL_ORIGIN;
use crate::metrics;
use crate::path;
use crate::registry::{content_hash, parse_guid, Kind};
use crate::status::Status;
use crate::store::{Counters, Store};
use crate::wire;

pub const PREFIX: &str = "/apteryx";
pub const WATCHERS: &str = "/apteryx/watchers";
pub const VALIDATORS: &str = "/apteryx/validators";
pub const REFRESHERS: &str = "/apteryx/refreshers";
pub const PROVIDERS: &str = "/apteryx/providers";
pub const INDEXERS: &str = "/apteryx/indexers";
pub const PROXIES: &str = "/apteryx/proxies";
pub const SOCKETS: &str = "/apteryx/sockets";
pub const DEBUG: &str = "/apteryx/debug";
pub const COUNTERS: &str = "/apteryx/counters";
pub const STATISTICS: &str = "/apteryx/statistics";

/// The statistics refresher's freshness window.
const STATISTICS_TTL_US: u64 = 1_000_000;

/// Single child segment of `parent`, if `path` is exactly one level below.
fn guid_of(path: &str, parent: &str) -> Option<String> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest.to_string())
}

/// Intercepts writes to the control paths. `None` means the path is not a
/// control path; `Some(Err)` aborts the whole mutation. Runs inside the
/// write path before validators, so a registration is live when the
/// triggering `set` returns.
pub(crate) fn control_write(
    store: &Store,
    path: &str,
    value: &Bytes,
) -> Option<Result<(), Status>> {
    if !path.starts_with(PREFIX) {
        return None;
    }
    for (parent, kind) in [
        (WATCHERS, Kind::Watch),
        (VALIDATORS, Kind::Validate),
        (REFRESHERS, Kind::Refresh),
        (PROVIDERS, Kind::Provide),
        (INDEXERS, Kind::Index),
        (PROXIES, Kind::Proxy),
    ] {
        if let Some(guid) = guid_of(path, parent) {
            return Some(registration_write(store, kind, &guid, value));
        }
    }
    if let Some(guid) = guid_of(path, SOCKETS) {
        return Some(socket_write(store, &guid, value));
    }
    if path == DEBUG {
        return Some(debug_write(value));
    }
    None
}

fn registration_write(
    store: &Store,
    kind: Kind,
    guid: &str,
    value: &Bytes,
) -> Result<(), Status> {
    let Some((pid, handle, hash)) = parse_guid(guid) else {
        return Err(Status::InvalidPath);
    };

    if value.is_empty() {
        if let Some(rec) = store.registry.remove(guid) {
            if rec.kind == Kind::Refresh {
                store.refresh.forget(guid);
            }
            if rec.pid == std::process::id() {
                store.handles.remove(rec.handle);
            }
            log::debug!("deregistered {:?} {}", rec.kind, guid);
        }
        metrics::REGISTRATION_COUNT.set(store.registry.len() as i64);
        return Ok(());
    }

    let text = std::str::from_utf8(value).map_err(|_| Status::Range)?;
    let (uri, pattern) = if kind == Kind::Proxy {
        // `URI:pattern`, e.g. unix:///tmp/r.sock:/remote/*
        let split = text.rfind(':').ok_or(Status::Range)?;
        let (uri, pattern) = (&text[..split], &text[split + 1..]);
        wire::parse_uri(uri)?;
        (Some(uri), pattern)
    } else {
        (None, text)
    };
    path::validate_pattern(pattern)?;
    // the GUID's hash field commits to the registration content
    if content_hash(pattern, uri) != hash {
        return Err(Status::InvalidPath);
    }

    store
        .registry
        .insert(kind, pattern, uri.map(String::from), pid, handle);
    metrics::REGISTRATION_COUNT.set(store.registry.len() as i64);
    log::debug!("registered {:?} {} at {}", kind, guid, pattern);
    Ok(())
}

fn socket_write(store: &Store, guid: &str, value: &Bytes) -> Result<(), Status> {
    let binder = store.binder.read();
    let Some(bind) = binder.as_ref() else {
        log::warn!("socket write for {} with no listener surface attached", guid);
        return Ok(());
    };
    if value.is_empty() {
        bind(guid, None);
        return Ok(());
    }
    let uri = std::str::from_utf8(value).map_err(|_| Status::Range)?;
    wire::parse_uri(uri)?;
    bind(guid, Some(uri));
    Ok(())
}

fn debug_write(value: &Bytes) -> Result<(), Status> {
    if value.is_empty() {
        return Ok(());
    }
    let text = std::str::from_utf8(value).map_err(|_| Status::Range)?;
    let level = match text.trim().parse::<u8>() {
        Ok(0) => log::LevelFilter::Off,
        Ok(1) => log::LevelFilter::Error,
        Ok(2) => log::LevelFilter::Warn,
        Ok(3) => log::LevelFilter::Info,
        Ok(4) => log::LevelFilter::Debug,
        Ok(5) => log::LevelFilter::Trace,
        _ => return Err(Status::Range),
    };
    log::set_max_level(level);
    Ok(())
}

/// Installs the built-in surfaces: the read-only counters provider (and its
/// indexer, so the counters enumerate), and the statistics refresher that
/// publishes per-registration `"count,min,avg,max"` through the public
/// `set` path once a second.
pub(crate) fn install_builtins(store: &Arc<Store>) {
    let weak = Arc::downgrade(store);
    store
        .provide(&format!("{}/*", COUNTERS), move |path| {
            let store = weak.upgrade()?;
            let name = path::leaf(path)?.to_string();
            store
                .counters()
                .lookup(&name)
                .map(|v| Bytes::from(v.to_string()))
        })
        .expect("cannot install counters provider");

    store
        .index(&format!("{}/*", COUNTERS), move |prefix| {
            if prefix == COUNTERS {
                Counters::NAMES
                    .iter()
                    .map(|n| path::join(COUNTERS, n))
                    .collect()
            } else {
                Vec::new()
            }
        })
        .expect("cannot install counters indexer");

    let weak = Arc::downgrade(store);
    store
        .refresh(&format!("{}/*", STATISTICS), move |_prefix| {
            if let Some(store) = weak.upgrade() {
                for rec in store.registry.records() {
                    let value = Bytes::from(rec.stats.render());
                    if let Err(e) = store.set(
                        LOCAL_ORIGIN,
                        &format!("{}/{}", STATISTICS, rec.guid),
                        value,
                    ) {
                        log::debug!("statistics write for {} failed: {}", rec.guid, e);
                    }
                }
            }
            STATISTICS_TTL_US
        })
        .expect("cannot install statistics refresher");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_of() {
        assert_eq!(
            guid_of("/apteryx/watchers/1-2-3", WATCHERS),
            Some("1-2-3".to_string())
        );
        assert_eq!(guid_of("/apteryx/watchers", WATCHERS), None);
        assert_eq!(guid_of("/apteryx/watchers/a/b", WATCHERS), None);
        assert_eq!(guid_of("/apteryx/validators/x", WATCHERS), None);
    }
}
