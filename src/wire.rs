// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
//! Length-delimited binary framing: a 4-byte big-endian body length, then a
//! 1-byte opcode and its payload. Scalars are big-endian, strings and byte
//! strings are u32-length-prefixed, lists are a u32 count followed by the
//! items, optionals are a u8 presence flag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::status::Status;

pub const OP_SET: u8 = 0x01;
pub const OP_GET: u8 = 0x02;
pub const OP_SEARCH: u8 = 0x03;
pub const OP_TRAVERSE: u8 = 0x04;
pub const OP_PRUNE: u8 = 0x05;
pub const OP_TIMESTAMP: u8 = 0x06;
pub const OP_FIND: u8 = 0x07;
pub const OP_QUERY: u8 = 0x08;
pub const OP_MEMUSE: u8 = 0x09;
pub const OP_TEST: u8 = 0x10;

/// SET flag: block until every watcher queued by this mutation completed.
pub const SET_FLAG_WAIT: u8 = 0x01;
/// SET flag: `cas_ts` is meaningful (0 then asserts the path has never been
/// written). Without it the trailing `cas_ts` is ignored.
pub const SET_FLAG_CAS: u8 = 0x02;

/// Upper bound on a frame body; anything larger closes the connection.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Multi-path write. With `SET_FLAG_CAS`, `cas_ts` is compared against
    /// the timestamp of the deepest common root of the written paths.
    Set {
        flags: u8,
        pairs: Vec<(String, Bytes, u64)>,
        cas_ts: u64,
    },
    Get {
        path: String,
    },
    Search {
        prefix: String,
    },
    Traverse {
        path: String,
    },
    Prune {
        path: String,
        cas_ts: u64,
    },
    Timestamp {
        path: String,
    },
    Find {
        pattern: String,
        clauses: Vec<(String, Bytes)>,
    },
    Query {
        template: Vec<(String, Bytes)>,
    },
    Memuse {
        path: String,
    },
    Test {
        mode: u8,
        echo: Bytes,
    },
}

/// Reply bodies. Every reply leads with an i32 status; a negative status
/// carries no payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(i32),
    Value(i32, Option<Bytes>),
    Paths(i32, Vec<String>),
    Tree(i32, Vec<(String, Bytes)>),
    Number(i32, u64),
    Echo(i32, Bytes),
}

impl Reply {
    pub fn status(&self) -> i32 {
        match self {
            Reply::Status(s)
            | Reply::Value(s, _)
            | Reply::Paths(s, _)
            | Reply::Tree(s, _)
            | Reply::Number(s, _)
            | Reply::Echo(s, _) => *s,
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn get_u8(buf: &mut Bytes) -> Result<u8, Status> {
    if buf.remaining() < 1 {
        return Err(Status::Proto);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, Status> {
    if buf.remaining() < 4 {
        return Err(Status::Proto);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, Status> {
    if buf.remaining() < 8 {
        return Err(Status::Proto);
    }
    Ok(buf.get_u64())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, Status> {
    if buf.remaining() < 4 {
        return Err(Status::Proto);
    }
    Ok(buf.get_i32())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, Status> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(Status::Proto);
    }
    Ok(buf.split_to(len))
}

fn get_str(buf: &mut Bytes) -> Result<String, Status> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Status::Proto)
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Request::Set { .. } => OP_SET,
            Request::Get { .. } => OP_GET,
            Request::Search { .. } => OP_SEARCH,
            Request::Traverse { .. } => OP_TRAVERSE,
            Request::Prune { .. } => OP_PRUNE,
            Request::Timestamp { .. } => OP_TIMESTAMP,
            Request::Find { .. } => OP_FIND,
            Request::Query { .. } => OP_QUERY,
            Request::Memuse { .. } => OP_MEMUSE,
            Request::Test { .. } => OP_TEST,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.opcode());
        match self {
            Request::Set {
                flags,
                pairs,
                cas_ts,
            } => {
                buf.put_u8(*flags);
                buf.put_u32(pairs.len() as u32);
                for (path, value, ts) in pairs {
                    put_str(&mut buf, path);
                    put_bytes(&mut buf, value);
                    buf.put_u64(*ts);
                }
                buf.put_u64(*cas_ts);
            }
            Request::Get { path }
            | Request::Search { prefix: path }
            | Request::Traverse { path }
            | Request::Timestamp { path }
            | Request::Memuse { path } => put_str(&mut buf, path),
            Request::Prune { path, cas_ts } => {
                put_str(&mut buf, path);
                buf.put_u64(*cas_ts);
            }
            Request::Find { pattern, clauses } => {
                put_str(&mut buf, pattern);
                buf.put_u32(clauses.len() as u32);
                for (leaf, value) in clauses {
                    put_str(&mut buf, leaf);
                    put_bytes(&mut buf, value);
                }
            }
            Request::Query { template } => {
                buf.put_u32(template.len() as u32);
                for (path, value) in template {
                    put_str(&mut buf, path);
                    put_bytes(&mut buf, value);
                }
            }
            Request::Test { mode, echo } => {
                buf.put_u8(*mode);
                put_bytes(&mut buf, echo);
            }
        }
        buf
    }

    pub fn decode(mut body: Bytes) -> Result<Request, Status> {
        let op = get_u8(&mut body)?;
        let req = match op {
            OP_SET => {
                let flags = get_u8(&mut body)?;
                let n = get_u32(&mut body)?;
                let mut pairs = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    let path = get_str(&mut body)?;
                    let value = get_bytes(&mut body)?;
                    let ts = get_u64(&mut body)?;
                    pairs.push((path, value, ts));
                }
                let cas_ts = get_u64(&mut body)?;
                Request::Set {
                    flags,
                    pairs,
                    cas_ts,
                }
            }
            OP_GET => Request::Get {
                path: get_str(&mut body)?,
            },
            OP_SEARCH => Request::Search {
                prefix: get_str(&mut body)?,
            },
            OP_TRAVERSE => Request::Traverse {
                path: get_str(&mut body)?,
            },
            OP_PRUNE => Request::Prune {
                path: get_str(&mut body)?,
                cas_ts: get_u64(&mut body)?,
            },
            OP_TIMESTAMP => Request::Timestamp {
                path: get_str(&mut body)?,
            },
            OP_FIND => {
                let pattern = get_str(&mut body)?;
                let n = get_u32(&mut body)?;
                let mut clauses = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    let leaf = get_str(&mut body)?;
                    let value = get_bytes(&mut body)?;
                    clauses.push((leaf, value));
                }
                Request::Find { pattern, clauses }
            }
            OP_QUERY => {
                let n = get_u32(&mut body)?;
                let mut template = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    let path = get_str(&mut body)?;
                    let value = get_bytes(&mut body)?;
                    template.push((path, value));
                }
                Request::Query { template }
            }
            OP_MEMUSE => Request::Memuse {
                path: get_str(&mut body)?,
            },
            OP_TEST => Request::Test {
                mode: get_u8(&mut body)?,
                echo: get_bytes(&mut body)?,
            },
            _ => return Err(Status::Proto),
        };
        if body.has_remaining() {
            return Err(Status::Proto);
        }
        Ok(req)
    }
}

impl Reply {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_i32(self.status());
        if self.status() < 0 {
            return buf;
        }
        match self {
            Reply::Status(_) => {}
            Reply::Value(_, value) => match value {
                Some(v) => {
                    buf.put_u8(1);
                    put_bytes(&mut buf, v);
                }
                None => buf.put_u8(0),
            },
            Reply::Paths(_, paths) => {
                buf.put_u32(paths.len() as u32);
                for p in paths {
                    put_str(&mut buf, p);
                }
            }
            Reply::Tree(_, leaves) => {
                buf.put_u32(leaves.len() as u32);
                for (path, value) in leaves {
                    put_str(&mut buf, path);
                    put_bytes(&mut buf, value);
                }
            }
            Reply::Number(_, n) => buf.put_u64(*n),
            Reply::Echo(_, echo) => put_bytes(&mut buf, echo),
        }
        buf
    }

    /// Decodes a reply body. The shape is chosen by the opcode of the
    /// request this is answering.
    pub fn decode(op: u8, mut body: Bytes) -> Result<Reply, Status> {
        let status = get_i32(&mut body)?;
        if status < 0 {
            return Ok(match op {
                OP_GET => Reply::Value(status, None),
                OP_SEARCH | OP_FIND => Reply::Paths(status, Vec::new()),
                OP_TRAVERSE | OP_QUERY => Reply::Tree(status, Vec::new()),
                OP_TIMESTAMP | OP_MEMUSE => Reply::Number(status, 0),
                OP_TEST => Reply::Echo(status, Bytes::new()),
                _ => Reply::Status(status),
            });
        }
        let reply = match op {
            OP_SET | OP_PRUNE => Reply::Status(status),
            OP_GET => {
                let present = get_u8(&mut body)?;
                let value = if present != 0 {
                    Some(get_bytes(&mut body)?)
                } else {
                    None
                };
                Reply::Value(status, value)
            }
            OP_SEARCH | OP_FIND => {
                let n = get_u32(&mut body)?;
                let mut paths = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    paths.push(get_str(&mut body)?);
                }
                Reply::Paths(status, paths)
            }
            OP_TRAVERSE | OP_QUERY => {
                let n = get_u32(&mut body)?;
                let mut leaves = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    let path = get_str(&mut body)?;
                    let value = get_bytes(&mut body)?;
                    leaves.push((path, value));
                }
                Reply::Tree(status, leaves)
            }
            OP_TIMESTAMP | OP_MEMUSE => Reply::Number(status, get_u64(&mut body)?),
            OP_TEST => Reply::Echo(status, get_bytes(&mut body)?),
            _ => return Err(Status::Proto),
        };
        if body.has_remaining() {
            return Err(Status::Proto);
        }
        Ok(reply)
    }
}

/// A listener or remote address. `unix:///path`, `tcp://host:port`, and
/// `tcp://[v6]:port` forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Unix(String),
    Tcp(String),
}

pub fn parse_uri(uri: &str) -> Result<Endpoint, Status> {
    if let Some(path) = uri.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(Status::InvalidPath);
        }
        return Ok(Endpoint::Unix(path.to_string()));
    }
    if let Some(addr) = uri.strip_prefix("tcp://") {
        if addr.is_empty() || !addr.contains(':') {
            return Err(Status::InvalidPath);
        }
        return Ok(Endpoint::Tcp(addr.to_string()));
    }
    Err(Status::InvalidPath)
}

/// Reads one frame body. `None` on clean EOF between frames.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Option<BytesMut>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(std::io::ErrorKind::InvalidData.into());
    }
    let mut body = BytesMut::zeroed(len);
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<S>(stream: &mut S, body: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Blocking twin of `read_frame` for the client side.
pub fn read_frame_sync<S: std::io::Read>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(std::io::ErrorKind::InvalidData.into());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(Some(body))
}

pub fn write_frame_sync<S: std::io::Write>(stream: &mut S, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}
