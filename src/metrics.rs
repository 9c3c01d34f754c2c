// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

/// A collection of Prometheus metrics for this application.
pub struct Metrics;

impl Metrics {
    /// Force initialization of all static metrics.
    /// You can call this in main() to ensure the metrics are registered.
    pub fn init() {
        // Accessing a static ref will trigger registration.
        let _ = &*REQUEST_COUNT;
        let _ = &*REQUEST_LATENCY;
        let _ = &*TREE_MEMUSE_BYTES;
        let _ = &*REGISTRATION_COUNT;
        let _ = &*CONNECTION_COUNT;
        let _ = &*CALLBACK_COUNT;
        let _ = &*CALLBACK_TIMEOUT_COUNT;
        let _ = &*PROXY_FALLTHROUGH_COUNT;

        // Check if a Tokio runtime is running
        let runtime_running = tokio::runtime::Handle::try_current().is_ok();

        // Only register metrics if a Tokio runtime is running
        if runtime_running {
            prometheus::default_registry()
                .register(Box::new(
                    tokio_metrics_collector::default_runtime_collector(),
                ))
                .unwrap();
        }
    }
}

/// Tracks the count of requests by type (get, set, search, prune, etc.).
pub static REQUEST_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "apteryx_requests_total",
        "Total requests received, labeled by request type",
        &["type"]
    )
    .expect("cannot create metric: apteryx_requests_total")
});

/// Tracks the latency of requests, labeled by request type.
pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "apteryx_request_latency_seconds",
        "Request latency distribution",
        &["type"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .expect("cannot create metric: apteryx_request_latency_seconds")
});

/// A gauge of the path tree's total memory accounting.
pub static TREE_MEMUSE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "apteryx_tree_memuse_bytes",
        "Value bytes plus per-node overhead currently held by the path tree"
    )
    .expect("cannot create metric: apteryx_tree_memuse_bytes")
});

pub static REGISTRATION_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "apteryx_registration_count",
        "Live callback registrations of all kinds"
    )
    .expect("cannot create metric: apteryx_registration_count")
});

pub static CONNECTION_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "apteryx_connection_count",
        "Currently accepted RPC connections"
    )
    .expect("cannot create metric: apteryx_connection_count")
});

/// Callback invocations, labeled by kind.
pub static CALLBACK_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "apteryx_callback_count",
        "Callback invocations, labeled by callback kind",
        &["kind"]
    )
    .expect("cannot create metric: apteryx_callback_count")
});

pub static CALLBACK_TIMEOUT_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "apteryx_callback_timeout_count",
        "Callback invocations that exceeded their wall-clock budget",
        &["kind"]
    )
    .expect("cannot create metric: apteryx_callback_timeout_count")
});

pub static PROXY_FALLTHROUGH_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "apteryx_proxy_fallthrough_count",
        "Operations that fell through to the local tree after a proxy failure",
        &["type"]
    )
    .expect("cannot create metric: apteryx_proxy_fallthrough_count")
});
