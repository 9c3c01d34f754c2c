// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::registry::Record;
use crate::status::Status;

/// Identity of the caller that triggered an operation. Watcher delivery is
/// FIFO per originator; unrelated originators dispatch in parallel.
pub type Origin = u64;

/// Originator id for library callers inside this process.
pub const LOCAL_ORIGIN: Origin = 1;

/// Worker threads act as originators for mutations issued from inside a
/// callback, so a nested set never queues behind the watcher that issued it.
const WORKER_ORIGIN_BASE: Origin = 1 << 62;

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(1);

/// What the current thread is dispatching, if it is a dispatcher worker.
#[derive(Clone)]
pub struct DispatchCtx {
    pub origin: Origin,
    pub guid: String,
}

thread_local! {
    static CTX: RefCell<Option<DispatchCtx>> = const { RefCell::new(None) };
}

/// The dispatch context of the calling thread. `Some` only on worker
/// threads while a callback is running; the engine uses it to re-originate
/// nested mutations and to detect self-waiting watchers.
pub fn current_ctx() -> Option<DispatchCtx> {
    CTX.with(|c| c.borrow().clone())
}

/// Completion latch for the watcher tasks queued by one mutation.
/// `set_wait` blocks on this until the batch drains.
pub struct Batch {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl Batch {
    pub fn new(tasks: usize) -> Arc<Batch> {
        Arc::new(Batch {
            remaining: Mutex::new(tasks),
            cv: Condvar::new(),
        })
    }

    fn done(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Waits for the batch to drain. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.cv.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }
}

struct Task {
    record: Arc<Record>,
    run: Box<dyn FnOnce() + Send>,
    batch: Option<Arc<Batch>>,
}

enum Msg {
    /// An originator has queued work; drain its queue FIFO.
    Run(Origin),
    /// A one-shot synchronous invocation (validator, provider, ...).
    Call(Task),
}

#[derive(Default)]
struct OriginQueue {
    tasks: VecDeque<Task>,
    active: bool,
}

/// Bounded worker pool delivering callbacks: watcher tasks FIFO per
/// originator, synchronous calls with a wall-clock budget.
pub struct Dispatcher {
    tx: Mutex<Option<Sender<Msg>>>,
    queues: Arc<Mutex<HashMap<Origin, OriginQueue>>>,
    pending: Arc<AtomicUsize>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(workers: usize, timeout: Duration) -> Self {
        let (tx, rx) = channel::unbounded();
        let queues: Arc<Mutex<HashMap<Origin, OriginQueue>>> = Arc::new(Mutex::new(HashMap::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        for idx in 0..workers.max(1) {
            let rx: Receiver<Msg> = rx.clone();
            let queues = queues.clone();
            let pending = pending.clone();
            std::thread::Builder::new()
                .name(format!("dispatch-{}", idx))
                .spawn(move || worker_loop(idx, rx, queues, pending, timeout))
                .expect("failed to spawn dispatch worker");
        }
        Dispatcher {
            tx: Mutex::new(Some(tx)),
            queues,
            pending,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn send(&self, msg: Msg) -> Result<(), Status> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| Status::Resource),
            None => Err(Status::Resource),
        }
    }

    /// Queues one watcher invocation under `origin`. The batch is the
    /// latch of the mutation that produced this task.
    pub fn enqueue(
        &self,
        origin: Origin,
        record: Arc<Record>,
        run: Box<dyn FnOnce() + Send>,
        batch: &Arc<Batch>,
    ) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock();
        let oq = queues.entry(origin).or_default();
        oq.tasks.push_back(Task {
            record,
            run,
            batch: Some(batch.clone()),
        });
        let kick = !oq.active;
        oq.active = true;
        drop(queues);
        if kick && self.send(Msg::Run(origin)).is_err() {
            // shutting down; the drain deadline already passed
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Runs `f` on a worker and waits for its result, up to the callback
    /// budget; expiry abandons the call. Nested calls from a worker thread
    /// run inline so a saturated pool cannot deadlock on itself.
    pub fn call<R: Send + 'static>(
        &self,
        record: &Arc<Record>,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, Status> {
        if current_ctx().is_some() {
            let start = Instant::now();
            let out = f();
            record.stats.record(start.elapsed().as_micros() as u64);
            return Ok(out);
        }
        let (tx, rx) = channel::bounded(1);
        self.pending.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            record: record.clone(),
            run: Box::new(move || {
                let _ = tx.send(f());
            }),
            batch: None,
        };
        if self.send(Msg::Call(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(Status::Resource);
        }
        rx.recv_timeout(self.timeout).map_err(|_| Status::TimedOut)
    }

    /// Lets queued work finish for up to `limit`, then stops accepting and
    /// releases the workers.
    pub fn shutdown(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.pending.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.tx.lock().take();
    }
}

fn worker_loop(
    idx: usize,
    rx: Receiver<Msg>,
    queues: Arc<Mutex<HashMap<Origin, OriginQueue>>>,
    pending: Arc<AtomicUsize>,
    timeout: Duration,
) {
    let worker_origin = WORKER_ORIGIN_BASE + idx as Origin;
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Call(task) => run_task(worker_origin, task, &pending, timeout),
            Msg::Run(origin) => loop {
                let task = {
                    let mut q = queues.lock();
                    match q.get_mut(&origin) {
                        Some(oq) => match oq.tasks.pop_front() {
                            Some(task) => Some(task),
                            None => {
                                q.remove(&origin);
                                None
                            }
                        },
                        None => None,
                    }
                };
                match task {
                    Some(task) => run_task(worker_origin, task, &pending, timeout),
                    None => break,
                }
            },
        }
    }
}

fn run_task(worker_origin: Origin, task: Task, pending: &AtomicUsize, timeout: Duration) {
    if !task.record.is_disabled() {
        CTX.with(|c| {
            *c.borrow_mut() = Some(DispatchCtx {
                origin: worker_origin,
                guid: task.record.guid.clone(),
            })
        });
        let start = Instant::now();
        (task.run)();
        let elapsed = start.elapsed();
        task.record.stats.record(elapsed.as_micros() as u64);
        if elapsed > timeout {
            log::warn!(
                "callback {} overran its {:?} budget ({:?})",
                task.record.guid,
                timeout,
                elapsed
            );
        }
        CTX.with(|c| *c.borrow_mut() = None);
    }
    if let Some(batch) = task.batch {
        batch.done();
    }
    pending.fetch_sub(1, Ordering::Relaxed);
}
