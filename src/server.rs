// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::net::ToSocketAddrs;
use std::sync::Arc;

use dashmap::DashMap;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

use crate::dispatch::Origin;
use crate::metrics;
use crate::status::Status;
use crate::store::Store;
use crate::wire::{self, Endpoint, Reply, Request, SET_FLAG_CAS, SET_FLAG_WAIT};

/// RPC listener surface. Listeners are keyed by the socket GUID that bound
/// them (`/apteryx/sockets/<guid>`); startup binds use synthetic keys.
pub struct Server {
    store: Arc<Store>,
    listeners: DashMap<String, JoinHandle<()>>,
}

impl Server {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Server {
            store,
            listeners: DashMap::new(),
        })
    }

    /// Wires `/apteryx/sockets/` writes to this server. Binds happen on the
    /// current runtime; the hook itself is called from engine threads.
    pub fn install_binder(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();
        self.store.set_socket_binder(move |guid, uri| {
            let Some(server) = weak.upgrade() else {
                return;
            };
            match uri {
                Some(uri) => {
                    let guid = guid.to_string();
                    let uri = uri.to_string();
                    handle.spawn(async move {
                        if let Err(e) = server.bind(&guid, &uri).await {
                            log::warn!("bind of {} at {} failed: {}", guid, uri, e);
                        }
                    });
                }
                None => server.release(guid),
            }
        });
    }

    pub async fn bind(&self, guid: &str, uri: &str) -> Result<(), Status> {
        self.release(guid);
        let task = match wire::parse_uri(uri)? {
            Endpoint::Unix(sock_path) => {
                // a stale socket file from a previous run would fail the bind
                let _ = std::fs::remove_file(&sock_path);
                let listener = UnixListener::bind(&sock_path)?;
                let store = self.store.clone();
                tokio::spawn(accept_unix(store, listener))
            }
            Endpoint::Tcp(addr) => {
                let resolved = addr
                    .to_socket_addrs()
                    .map_err(|_| Status::Resource)?
                    .next()
                    .ok_or(Status::Resource)?;
                let domain = if resolved.is_ipv6() {
                    Domain::IPV6
                } else {
                    Domain::IPV4
                };
                let socket = Socket::new(domain, Type::STREAM, None)?;
                socket.set_reuse_address(true)?;
                socket.bind(&resolved.into())?;
                socket.listen(1024)?;
                socket.set_nonblocking(true)?;
                let listener = TcpListener::from_std(socket.into())?;
                let store = self.store.clone();
                tokio::spawn(accept_tcp(store, listener))
            }
        };
        log::info!("listening on {}", uri);
        self.listeners.insert(guid.to_string(), task);
        Ok(())
    }

    pub fn release(&self, guid: &str) {
        if let Some((_, task)) = self.listeners.remove(guid) {
            task.abort();
            log::info!("released listener {}", guid);
        }
    }
}

async fn accept_unix(store: Arc<Store>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let store = store.clone();
                tokio::spawn(connection(store, stream));
            }
            Err(e) => {
                log::warn!("unix accept failed: {}", e);
                return;
            }
        }
    }
}

async fn accept_tcp(store: Arc<Store>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let _ = stream.set_nodelay(true);
                let store = store.clone();
                tokio::spawn(connection(store, stream));
            }
            Err(e) => {
                log::warn!("tcp accept failed: {}", e);
                return;
            }
        }
    }
}

/// One task per accepted connection: requests are answered in arrival
/// order on the same socket. The connection is one originator, so its
/// watcher deliveries are FIFO. A malformed frame closes the connection.
async fn connection<S>(store: Arc<Store>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let origin = store.new_origin();
    metrics::CONNECTION_COUNT.inc();
    loop {
        let body = match wire::read_frame(&mut stream).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                log::debug!("connection {} read failed: {}", origin, e);
                break;
            }
        };
        let reply = match Request::decode(body.freeze()) {
            Ok(req) => tokio::task::block_in_place(|| handle_request(&store, origin, &req)),
            Err(_) => {
                log::debug!("connection {} sent a malformed frame", origin);
                break;
            }
        };
        if let Err(e) = wire::write_frame(&mut stream, &reply.encode()).await {
            log::debug!("connection {} write failed: {}", origin, e);
            break;
        }
    }
    metrics::CONNECTION_COUNT.dec();
}

/// Maps one decoded request onto the engine. Blocking: mutations may wait
/// on validators and (with the wait flag) on watcher completion.
pub fn handle_request(store: &Store, origin: Origin, req: &Request) -> Reply {
    match req {
        Request::Set {
            flags,
            pairs,
            cas_ts,
        } => {
            let wait = flags & SET_FLAG_WAIT != 0;
            let cas = (flags & SET_FLAG_CAS != 0).then_some(*cas_ts);
            let pairs = pairs
                .iter()
                .map(|(p, v, _ts)| (p.clone(), v.clone()))
                .collect();
            match store.apply(origin, pairs, cas, wait) {
                Ok(()) => Reply::Status(0),
                Err(e) => Reply::Status(e.code()),
            }
        }
        Request::Get { path } => match store.get(origin, path) {
            Ok(value) => Reply::Value(0, value),
            Err(e) => Reply::Value(e.code(), None),
        },
        Request::Search { prefix } => match store.search(origin, prefix) {
            Ok(paths) => Reply::Paths(0, paths),
            Err(e) => Reply::Paths(e.code(), Vec::new()),
        },
        Request::Traverse { path } => match store.traverse(origin, path) {
            Ok(doc) => Reply::Tree(0, doc.into_pairs()),
            Err(e) => Reply::Tree(e.code(), Vec::new()),
        },
        Request::Prune { path, cas_ts } => {
            let cas = (*cas_ts > 0).then_some(*cas_ts);
            match store.prune(origin, path, cas) {
                Ok(()) => Reply::Status(0),
                Err(e) => Reply::Status(e.code()),
            }
        }
        Request::Timestamp { path } => match store.timestamp(origin, path) {
            Ok(ts) => Reply::Number(0, ts),
            Err(e) => Reply::Number(e.code(), 0),
        },
        Request::Find { pattern, clauses } => match store.find(origin, pattern, clauses) {
            Ok(paths) => Reply::Paths(0, paths),
            Err(e) => Reply::Paths(e.code(), Vec::new()),
        },
        Request::Query { template } => {
            let template = crate::doc::TreeDoc::from_pairs(template.clone());
            match store.query(origin, &template) {
                Ok(doc) => Reply::Tree(0, doc.into_pairs()),
                Err(e) => Reply::Tree(e.code(), Vec::new()),
            }
        }
        Request::Memuse { path } => match store.memuse(origin, path) {
            Ok(bytes) => Reply::Number(0, bytes),
            Err(e) => Reply::Number(e.code(), 0),
        },
        Request::Test { mode, echo } => {
            // non-zero mode sleeps that many milliseconds, for timeout tests
            if *mode > 0 {
                std::thread::sleep(std::time::Duration::from_millis(*mode as u64));
            }
            Reply::Echo(0, echo.clone())
        }
    }
}
