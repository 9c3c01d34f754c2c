// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::doc::TreeDoc;
use crate::status::Status;
use crate::wire::{self, Endpoint, Reply, Request, SET_FLAG_CAS, SET_FLAG_WAIT};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

fn connect(uri: &str, timeout: Duration) -> Result<Stream, Status> {
    match wire::parse_uri(uri)? {
        Endpoint::Unix(path) => {
            let s = UnixStream::connect(&path)?;
            s.set_read_timeout(Some(timeout))?;
            s.set_write_timeout(Some(timeout))?;
            Ok(Stream::Unix(s))
        }
        Endpoint::Tcp(addr) => {
            let resolved = addr
                .to_socket_addrs()
                .map_err(|_| Status::Resource)?
                .next()
                .ok_or(Status::Resource)?;
            let s = TcpStream::connect_timeout(&resolved, timeout)?;
            s.set_read_timeout(Some(timeout))?;
            s.set_write_timeout(Some(timeout))?;
            s.set_nodelay(true)?;
            Ok(Stream::Tcp(s))
        }
    }
}

/// Blocking RPC client with one connection pool per remote URI. A
/// connection that errors or times out is dropped from the pool instead of
/// being returned.
pub struct ClientPool {
    timeout: Duration,
    conns: Mutex<HashMap<String, Vec<Stream>>>,
}

impl ClientPool {
    pub fn new(timeout: Duration) -> Self {
        ClientPool {
            timeout,
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn checkout(&self, uri: &str) -> Result<Stream, Status> {
        if let Some(s) = self
            .conns
            .lock()
            .get_mut(uri)
            .and_then(|pool| pool.pop())
        {
            return Ok(s);
        }
        connect(uri, self.timeout)
    }

    fn checkin(&self, uri: &str, stream: Stream) {
        self.conns
            .lock()
            .entry(uri.to_string())
            .or_default()
            .push(stream);
    }

    pub fn request(&self, uri: &str, req: &Request) -> Result<Reply, Status> {
        let mut stream = self.checkout(uri)?;
        let body = req.encode();
        let result: Result<Vec<u8>, Status> = (|| {
            wire::write_frame_sync(&mut stream, &body)?;
            match wire::read_frame_sync(&mut stream)? {
                Some(reply) => Ok(reply),
                None => Err(Status::Proto),
            }
        })();
        match result {
            Ok(reply_body) => {
                let reply = Reply::decode(req.opcode(), Bytes::from(reply_body))?;
                self.checkin(uri, stream);
                Ok(reply)
            }
            // the connection is in an unknown state; let it drop
            Err(e) => Err(e),
        }
    }

    pub fn set(
        &self,
        uri: &str,
        pairs: Vec<(String, Bytes)>,
        cas_ts: Option<u64>,
        wait: bool,
    ) -> Result<(), Status> {
        let mut flags = if wait { SET_FLAG_WAIT } else { 0 };
        if cas_ts.is_some() {
            flags |= SET_FLAG_CAS;
        }
        let req = Request::Set {
            flags,
            pairs: pairs.into_iter().map(|(p, v)| (p, v, 0)).collect(),
            cas_ts: cas_ts.unwrap_or(0),
        };
        match self.request(uri, &req)? {
            Reply::Status(s) => Status::from_code(s),
            _ => Err(Status::Proto),
        }
    }

    pub fn get(&self, uri: &str, path: &str) -> Result<Option<Bytes>, Status> {
        let req = Request::Get {
            path: path.to_string(),
        };
        match self.request(uri, &req)? {
            Reply::Value(s, value) => Status::from_code(s).map(|_| value),
            _ => Err(Status::Proto),
        }
    }

    pub fn search(&self, uri: &str, prefix: &str) -> Result<Vec<String>, Status> {
        let req = Request::Search {
            prefix: prefix.to_string(),
        };
        match self.request(uri, &req)? {
            Reply::Paths(s, paths) => Status::from_code(s).map(|_| paths),
            _ => Err(Status::Proto),
        }
    }

    pub fn traverse(&self, uri: &str, path: &str) -> Result<TreeDoc, Status> {
        let req = Request::Traverse {
            path: path.to_string(),
        };
        match self.request(uri, &req)? {
            Reply::Tree(s, leaves) => {
                Status::from_code(s).map(|_| TreeDoc::from_pairs(leaves))
            }
            _ => Err(Status::Proto),
        }
    }

    pub fn prune(&self, uri: &str, path: &str, cas_ts: u64) -> Result<(), Status> {
        let req = Request::Prune {
            path: path.to_string(),
            cas_ts,
        };
        match self.request(uri, &req)? {
            Reply::Status(s) => Status::from_code(s),
            _ => Err(Status::Proto),
        }
    }

    pub fn timestamp(&self, uri: &str, path: &str) -> Result<u64, Status> {
        let req = Request::Timestamp {
            path: path.to_string(),
        };
        match self.request(uri, &req)? {
            Reply::Number(s, ts) => Status::from_code(s).map(|_| ts),
            _ => Err(Status::Proto),
        }
    }

    pub fn memuse(&self, uri: &str, path: &str) -> Result<u64, Status> {
        let req = Request::Memuse {
            path: path.to_string(),
        };
        match self.request(uri, &req)? {
            Reply::Number(s, n) => Status::from_code(s).map(|_| n),
            _ => Err(Status::Proto),
        }
    }

    pub fn find(
        &self,
        uri: &str,
        pattern: &str,
        clauses: Vec<(String, Bytes)>,
    ) -> Result<Vec<String>, Status> {
        let req = Request::Find {
            pattern: pattern.to_string(),
            clauses,
        };
        match self.request(uri, &req)? {
            Reply::Paths(s, paths) => Status::from_code(s).map(|_| paths),
            _ => Err(Status::Proto),
        }
    }

    pub fn query(&self, uri: &str, template: &TreeDoc) -> Result<TreeDoc, Status> {
        let req = Request::Query {
            template: template.clone().into_pairs(),
        };
        match self.request(uri, &req)? {
            Reply::Tree(s, leaves) => {
                Status::from_code(s).map(|_| TreeDoc::from_pairs(leaves))
            }
            _ => Err(Status::Proto),
        }
    }

    pub fn test(&self, uri: &str, mode: u8, echo: Bytes) -> Result<Bytes, Status> {
        let req = Request::Test { mode, echo };
        match self.request(uri, &req)? {
            Reply::Echo(s, echo) => Status::from_code(s).map(|_| echo),
            _ => Err(Status::Proto),
        }
    }
}

/// Convenience handle bound to a single daemon URI.
pub struct Client {
    pool: ClientPool,
    uri: String,
}

impl Client {
    pub fn new(uri: impl Into<String>) -> Self {
        Client::with_timeout(uri, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(uri: impl Into<String>, timeout: Duration) -> Self {
        Client {
            pool: ClientPool::new(timeout),
            uri: uri.into(),
        }
    }

    pub fn set(&self, path: &str, value: impl Into<Bytes>) -> Result<(), Status> {
        self.pool
            .set(&self.uri, vec![(path.to_string(), value.into())], None, false)
    }

    /// Like `set`, but blocks until every watcher fired by the write has
    /// completed.
    pub fn set_wait(&self, path: &str, value: impl Into<Bytes>) -> Result<(), Status> {
        self.pool
            .set(&self.uri, vec![(path.to_string(), value.into())], None, true)
    }

    /// Compare-and-swap: applies only if the path's timestamp still equals
    /// `ts` (0 asserts the path has never been written).
    pub fn cas(&self, path: &str, value: impl Into<Bytes>, ts: u64) -> Result<(), Status> {
        self.pool.set(
            &self.uri,
            vec![(path.to_string(), value.into())],
            Some(ts),
            false,
        )
    }

    pub fn set_tree(&self, doc: &TreeDoc, wait: bool) -> Result<(), Status> {
        self.pool.set(&self.uri, doc.clone().into_pairs(), None, wait)
    }

    /// `set_tree` guarded by the timestamp of the document's root path.
    pub fn set_tree_cas(&self, doc: &TreeDoc, expected_ts: u64, wait: bool) -> Result<(), Status> {
        self.pool
            .set(&self.uri, doc.clone().into_pairs(), Some(expected_ts), wait)
    }

    pub fn get(&self, path: &str) -> Result<Option<Bytes>, Status> {
        self.pool.get(&self.uri, path)
    }

    pub fn search(&self, prefix: &str) -> Result<Vec<String>, Status> {
        self.pool.search(&self.uri, prefix)
    }

    pub fn traverse(&self, path: &str) -> Result<TreeDoc, Status> {
        self.pool.traverse(&self.uri, path)
    }

    pub fn prune(&self, path: &str) -> Result<(), Status> {
        self.pool.prune(&self.uri, path, 0)
    }

    pub fn timestamp(&self, path: &str) -> Result<u64, Status> {
        self.pool.timestamp(&self.uri, path)
    }

    pub fn memuse(&self, path: &str) -> Result<u64, Status> {
        self.pool.memuse(&self.uri, path)
    }

    pub fn find(&self, pattern: &str, value: impl Into<Bytes>) -> Result<Vec<String>, Status> {
        self.pool
            .find(&self.uri, pattern, vec![(String::new(), value.into())])
    }

    pub fn find_tree(
        &self,
        pattern: &str,
        clauses: Vec<(String, Bytes)>,
    ) -> Result<Vec<String>, Status> {
        self.pool.find(&self.uri, pattern, clauses)
    }

    pub fn query(&self, template: &TreeDoc) -> Result<TreeDoc, Status> {
        self.pool.query(&self.uri, template)
    }

    pub fn test(&self, mode: u8, echo: impl Into<Bytes>) -> Result<Bytes, Status> {
        self.pool.test(&self.uri, mode, echo.into())
    }
}
