use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use apteryx::store::{Store, StoreOptions};
use apteryx::{Status, LOCAL_ORIGIN};

macro_rules! as_bytes {
    ($v:expr) => {
        Bytes::from_static($v)
    };
}

fn store() -> Arc<Store> {
    Store::new(StoreOptions::default())
}

#[test]
fn test_watcher_sees_set_and_delete() {
    let s = store();
    let events: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    s.watch("/test/zones/*", move |path, value| {
        events2.lock().push((path.to_string(), value.to_vec()));
    })
    .unwrap();

    s.set_wait(LOCAL_ORIGIN, "/test/zones/private", as_bytes!(b"up"))
        .unwrap();
    assert_eq!(
        *events.lock(),
        vec![("/test/zones/private".to_string(), b"up".to_vec())]
    );

    s.set_wait(LOCAL_ORIGIN, "/test/zones/private", as_bytes!(b""))
        .unwrap();
    assert_eq!(events.lock().len(), 2);
    assert_eq!(events.lock()[1], ("/test/zones/private".to_string(), Vec::new()));

    // an unrelated path does not fire
    s.set_wait(LOCAL_ORIGIN, "/other/path", as_bytes!(b"x")).unwrap();
    assert_eq!(events.lock().len(), 2);
}

#[test]
fn test_watcher_fires_once_per_registration() {
    let s = store();
    let narrow_hits = Arc::new(AtomicUsize::new(0));
    let wide_hits = Arc::new(AtomicUsize::new(0));
    let n2 = narrow_hits.clone();
    let w2 = wide_hits.clone();
    s.watch("/multi/a", move |_p, _v| {
        n2.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    s.watch("/multi/*", move |_p, _v| {
        w2.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    s.set_wait(LOCAL_ORIGIN, "/multi/a", as_bytes!(b"1")).unwrap();
    assert_eq!(narrow_hits.load(Ordering::Relaxed), 1);
    assert_eq!(wide_hits.load(Ordering::Relaxed), 1);
}

#[test]
fn test_watcher_delivery_in_stamp_order() {
    let s = store();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    s.watch("/ordered/*", move |_p, v| {
        seen2.lock().push(String::from_utf8(v.to_vec()).unwrap());
    })
    .unwrap();

    for i in 0..50 {
        s.set(LOCAL_ORIGIN, "/ordered/key", Bytes::from(format!("{:03}", i)))
            .unwrap();
    }
    // the last set waits out the whole originator queue
    s.set_wait(LOCAL_ORIGIN, "/ordered/key", as_bytes!(b"end")).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 51);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(*seen, sorted, "deliveries out of stamp order");
    assert_eq!(seen.last().unwrap(), "end");
}

#[test]
fn test_validator_vetoes_before_anything_lands() {
    let s = store();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    s.watch("/guarded/*", move |_p, _v| {
        fired2.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    s.validate("/guarded/*", |_path, value| {
        if value.as_ref() == b"bad" {
            -libc::EPERM
        } else {
            0
        }
    })
    .unwrap();

    assert_eq!(
        s.set_wait(LOCAL_ORIGIN, "/guarded/x", as_bytes!(b"bad")),
        Err(Status::Refused(-libc::EPERM))
    );
    assert_eq!(s.get(LOCAL_ORIGIN, "/guarded/x").unwrap(), None);
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    s.set_wait(LOCAL_ORIGIN, "/guarded/x", as_bytes!(b"good")).unwrap();
    assert_eq!(s.get(LOCAL_ORIGIN, "/guarded/x").unwrap(), Some(as_bytes!(b"good")));
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_prune_delivers_empty_values_per_path() {
    let s = store();
    let events: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    s.watch("/prunable/*", move |p, v| {
        events2.lock().push((p.to_string(), v.to_vec()));
    })
    .unwrap();

    s.set_wait(LOCAL_ORIGIN, "/prunable/a", as_bytes!(b"1")).unwrap();
    s.set_wait(LOCAL_ORIGIN, "/prunable/b/c", as_bytes!(b"2")).unwrap();
    events.lock().clear();

    s.prune(LOCAL_ORIGIN, "/prunable", None).unwrap();
    // prune does not wait; give the dispatcher a moment
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while events.lock().len() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let got = events.lock().clone();
    assert_eq!(got.len(), 2);
    assert!(got.contains(&("/prunable/a".to_string(), Vec::new())));
    assert!(got.contains(&("/prunable/b/c".to_string(), Vec::new())));
}

#[test]
fn test_tree_watcher_gets_one_event_per_batch() {
    let s = store();
    let batches = Arc::new(Mutex::new(Vec::new()));
    let batches2 = batches.clone();
    s.watch_tree("/bulk/*", move |doc| {
        batches2.lock().push(doc.clone());
    })
    .unwrap();

    let mut doc = apteryx::TreeDoc::new();
    doc.insert("/bulk/a", "1");
    doc.insert("/bulk/b", "2");
    doc.insert("/bulk/c", "3");
    s.set_tree(LOCAL_ORIGIN, &doc, 0, true).unwrap();

    {
        let got = batches.lock();
        assert_eq!(got.len(), 1, "expected one tree event per batch");
        assert_eq!(got[0].len(), 3);
        assert_eq!(got[0].get("/bulk/b"), Some(&as_bytes!(b"2")));
    }

    // prune is likewise a single tree-shaped event with empty leaves
    s.prune(LOCAL_ORIGIN, "/bulk", None).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while batches.lock().len() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let got = batches.lock();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1].len(), 3);
    assert_eq!(got[1].get("/bulk/a"), Some(&Bytes::new()));
}

#[test]
fn test_watcher_nested_set_does_not_self_block() {
    let s = store();
    let nested_result: Arc<Mutex<Option<Result<(), Status>>>> = Arc::new(Mutex::new(None));
    let nested2 = nested_result.clone();
    let weak = Arc::downgrade(&s);
    s.watch("/recurse/*", move |path, value| {
        let Some(s) = weak.upgrade() else { return };
        if value.as_ref() != b"done" {
            // a watcher set_waiting its own pattern must not deadlock
            *nested2.lock() = Some(s.set_wait(LOCAL_ORIGIN, path, Bytes::from_static(b"done")));
        }
    })
    .unwrap();

    s.set_wait(LOCAL_ORIGIN, "/recurse/x", as_bytes!(b"start")).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(result) = nested_result.lock().clone() {
            assert_eq!(result, Err(Status::TimedOut));
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "nested set never completed"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    // the nested mutation itself landed
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while s.get(LOCAL_ORIGIN, "/recurse/x").unwrap() != Some(as_bytes!(b"done")) {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_validator_timeout_is_a_veto() {
    let s = Store::new(StoreOptions {
        callback_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    s.validate("/slow/*", |_p, _v| {
        std::thread::sleep(Duration::from_millis(500));
        0
    })
    .unwrap();
    assert_eq!(
        s.set(LOCAL_ORIGIN, "/slow/x", as_bytes!(b"1")),
        Err(Status::TimedOut)
    );
    assert_eq!(s.get(LOCAL_ORIGIN, "/slow/x").unwrap(), None);
}

#[test]
fn test_deregistration_stops_delivery() {
    let s = store();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let guid = s
        .watch("/gone/*", move |_p, _v| {
            hits2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    s.set_wait(LOCAL_ORIGIN, "/gone/x", as_bytes!(b"1")).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    s.unregister(&guid).unwrap();
    s.set_wait(LOCAL_ORIGIN, "/gone/x", as_bytes!(b"2")).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn test_disabled_registration_kept_but_skipped() {
    let s = store();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let guid = s
        .watch("/dim/*", move |_p, _v| {
            hits2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    assert!(s.set_disabled(&guid, true));
    s.set_wait(LOCAL_ORIGIN, "/dim/x", as_bytes!(b"1")).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 0);

    assert!(s.set_disabled(&guid, false));
    s.set_wait(LOCAL_ORIGIN, "/dim/x", as_bytes!(b"2")).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn test_registration_surface_is_watchable() {
    let s = store();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    s.watch("/apteryx/watchers/*", move |path, _value| {
        seen2.lock().push(path.to_string());
    })
    .unwrap();

    let guid = s.watch("/observed/*", |_p, _v| {}).unwrap();
    // the registration write flows through the ordinary watch path
    s.set_wait(LOCAL_ORIGIN, "/sync/marker", as_bytes!(b"x")).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while seen.lock().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(seen
        .lock()
        .iter()
        .any(|p| p == &format!("/apteryx/watchers/{}", guid)));
}

#[test]
fn test_foreign_pid_registration_accepted_but_skipped() {
    let s = store();
    // a registration written with some other process's pid cannot resolve
    // to a handle here; the write itself must still succeed
    let pattern = "/foreign/*";
    let hash = apteryx::registry::content_hash(pattern, None);
    let guid = apteryx::registry::format_guid(99999, 42, hash);
    s.set(
        LOCAL_ORIGIN,
        &format!("/apteryx/watchers/{}", guid),
        Bytes::from(pattern),
    )
    .unwrap();

    s.set_wait(LOCAL_ORIGIN, "/foreign/x", as_bytes!(b"1")).unwrap();
    assert_eq!(s.get(LOCAL_ORIGIN, "/foreign/x").unwrap(), Some(as_bytes!(b"1")));

    // and an empty write destroys it
    s.set(
        LOCAL_ORIGIN,
        &format!("/apteryx/watchers/{}", guid),
        Bytes::new(),
    )
    .unwrap();
}
