// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use apteryx::Client;
use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;

/// Stress client arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon URI to hammer.
    #[arg(long, default_value = "unix:///tmp/apteryx.sock")]
    uri: String,

    /// Number of keys to use.
    #[arg(long, default_value_t = 100_000)]
    keys: usize,

    /// Number of iterations to run.
    #[arg(long, default_value_t = 10)]
    iterations: usize,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Value payload size in bytes.
    #[arg(long, default_value_t = 4096)]
    value_size: usize,

    #[arg(long, default_value_t = false)]
    prompt: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let keys = args.keys;
    let iterations = args.iterations;
    let threads = args.threads;

    let mut value = Vec::from(b"hello".as_slice());
    value.resize(args.value_size, 0);
    let value = Bytes::from(value);

    println!("Starting to set {} keys {} times", keys, iterations);
    let errors = Arc::new(Mutex::new(0u64));
    let write_start = std::time::Instant::now();
    for iter in 0..iterations {
        let mut workers = Vec::new();
        for t in 0..threads {
            let uri = args.uri.clone();
            let value = value.clone();
            let errors = Arc::clone(&errors);
            workers.push(std::thread::spawn(move || {
                let client = Client::new(uri);
                let mut k = t;
                while k < keys {
                    if let Err(e) = client.set(&format!("/stress/nodes/node-{}", k), value.clone())
                    {
                        log::warn!("set of node-{} failed: {}", k, e);
                        *errors.lock() += 1;
                    }
                    k += threads;
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        println!("Done writing {} keys", (iter + 1) * keys);
    }
    let write_duration = write_start.elapsed();
    println!(
        "Done writing {} keys in {} iterations ({:?}, {} errors)",
        keys * iterations,
        iterations,
        write_duration,
        *errors.lock()
    );

    if args.prompt {
        println!("Press Enter to continue...");
        let _ = std::io::stdin().read_line(&mut String::new());
    }

    println!("Doing search and read-back queries");
    let client = Client::new(args.uri.clone());
    let start = std::time::Instant::now();
    let children = client.search("/stress/nodes")?;
    println!("Search returned {} children", children.len());

    let mut read = 0usize;
    for path in children.iter().step_by(500) {
        if client.get(path)?.is_some() {
            read += 1;
        }
    }
    let duration = start.elapsed();
    println!(
        "Done queries: {} point reads. Duration: {:?}, or avg {:?} per request",
        read,
        duration,
        duration / (read.max(1) as u32)
    );

    let memuse = client.memuse("/stress")?;
    println!("Server reports {} bytes under /stress", memuse);

    Ok(())
}
