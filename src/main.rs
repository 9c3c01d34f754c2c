// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

use apteryx::metrics;
use apteryx::server::Server;
use apteryx::store::{Store, StoreOptions};

#[derive(Parser, Debug)]
#[command(name = "apteryxd", version, about = "Shared hierarchical datastore daemon", long_about = None)]
struct Cli {
    /// Listen URI (unix:///path or tcp://host:port); repeatable
    #[arg(long = "listen", env = "APTERYX_URL", default_value = "unix:///tmp/apteryx.sock")]
    listen: Vec<String>,

    /// Metrics port
    #[arg(long = "metrics-port", env = "APTERYX_METRICS_PORT", default_value_t = 9000)]
    metrics_port: u16,

    /// Callback dispatch worker threads
    #[arg(long = "workers", env = "APTERYX_WORKERS", default_value_t = 8)]
    workers: usize,

    /// Wall-clock budget per callback invocation
    #[arg(long = "callback-timeout-ms", default_value_t = 1000)]
    callback_timeout_ms: u64,

    /// Budget per proxied RPC round trip
    #[arg(long = "rpc-timeout-ms", default_value_t = 1000)]
    rpc_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let store = Store::new(StoreOptions {
        workers: cli.workers,
        callback_timeout: Duration::from_millis(cli.callback_timeout_ms),
        rpc_timeout: Duration::from_millis(cli.rpc_timeout_ms),
    });

    let server = Server::new(Arc::clone(&store));
    server.install_binder();
    for (i, uri) in cli.listen.iter().enumerate() {
        server.bind(&format!("boot-{}", i), uri).await?;
        println!("Listening on {}", uri);
    }

    // Build the Axum metrics app
    let metrics_store = Arc::clone(&store);
    let metrics_app = Router::new().route(
        "/metrics",
        get(move || {
            let store = Arc::clone(&metrics_store);
            async move {
                metrics::TREE_MEMUSE_BYTES.set(store.memuse_total() as i64);
                metrics::REGISTRATION_COUNT.set(store.registration_count() as i64);

                let metric_families = prometheus::gather();
                let mut buf = Vec::new();
                let encoder = TextEncoder::new();
                encoder.encode(&metric_families, &mut buf).unwrap();
                String::from_utf8(buf).unwrap()
            }
        }),
    );

    // Bind a listener for the metrics endpoint
    let metrics_listener =
        tokio::net::TcpListener::bind(format!("[::]:{}", cli.metrics_port)).await?;

    // Spawn the metrics server in its own task
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app).await.unwrap();
    });

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    store.shutdown(Duration::from_secs(2));
    Ok(())
}
