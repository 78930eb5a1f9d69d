//! In-process server for driver integration tests
//!
//! Speaks the legacy handshake and the framed JSON protocol. SERVER_INFO,
//! NOREPLY_WAIT and STOP are answered automatically; START and CONTINUE go
//! to a per-server handler that decides what to send back.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docdb::{ConnectOpts, HandshakeVersion, Host};
use docdb_proto::{read_frame, write_frame};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const START: i64 = 1;
pub const CONTINUE: i64 = 2;
pub const STOP: i64 = 3;
pub const NOREPLY_WAIT: i64 = 4;
pub const SERVER_INFO: i64 = 5;

/// One query as seen by the server
#[derive(Debug, Clone)]
pub struct Received {
    /// Accept order of the connection it arrived on, starting at 0
    pub conn: usize,
    pub token: u64,
    pub query_type: i64,
    /// Term of the START that opened this token
    pub term: Value,
    pub opts: Value,
    /// 0 for the START, n for the n-th CONTINUE on the same token
    pub index: usize,
}

pub enum Reply {
    Frames(Vec<Value>),
    Silent,
    Hangup,
}

type Handler = Arc<dyn Fn(&Received) -> Reply + Send + Sync>;

#[derive(Default)]
struct Stats {
    received: Mutex<Vec<Received>>,
    accepted: AtomicUsize,
    closed: AtomicUsize,
}

pub struct MockServer {
    pub id: String,
    addr: SocketAddr,
    stats: Arc<Stats>,
}

impl MockServer {
    pub async fn start<F>(id: &str, handler: F) -> Self
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());
        let handler: Handler = Arc::new(handler);

        let server_id = id.to_string();
        let server_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let conn = server_stats.accepted.fetch_add(1, Ordering::SeqCst);
                let stats = server_stats.clone();
                let handler = handler.clone();
                let id = server_id.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, conn, &id, &handler, &stats).await;
                    stats.closed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            id: id.to_string(),
            addr,
            stats,
        }
    }

    /// Server that replies with an atom of its own id to every START
    pub async fn echo(id: &str) -> Self {
        let reply = id.to_string();
        Self::start(id, move |_| Reply::Frames(vec![atom(json!(reply))])).await
    }

    /// Accepts connections and drops them straight away
    pub async fn hangup() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());

        let server_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                server_stats.accepted.fetch_add(1, Ordering::SeqCst);
                drop(socket);
                server_stats.closed.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self {
            id: String::new(),
            addr,
            stats,
        }
    }

    pub fn host(&self) -> Host {
        Host::new("127.0.0.1", self.addr.port())
    }

    pub fn address(&self) -> String {
        self.host().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn received(&self) -> Vec<Received> {
        self.stats.received.lock().clone()
    }

    /// Queries of `query_type` received so far
    pub fn count(&self, query_type: i64) -> usize {
        self.stats
            .received
            .lock()
            .iter()
            .filter(|r| r.query_type == query_type)
            .count()
    }

    pub fn accepted(&self) -> usize {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.stats.closed.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut socket: TcpStream,
    conn: usize,
    id: &str,
    handler: &Handler,
    stats: &Stats,
) -> std::io::Result<()> {
    accept_legacy(&mut socket).await?;

    let mut terms: HashMap<u64, (Value, Value, usize)> = HashMap::new();
    loop {
        let frame = match read_frame(&mut socket).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };
        let body: Value = serde_json::from_slice(&frame.body).unwrap_or(Value::Null);
        let query_type = body[0].as_i64().unwrap_or_default();

        let (term, opts, index) = match query_type {
            START => {
                let entry = (body[1].clone(), body[2].clone(), 0);
                terms.insert(frame.token, entry.clone());
                entry
            }
            _ => match terms.get_mut(&frame.token) {
                Some(entry) => {
                    if query_type == CONTINUE {
                        entry.2 += 1;
                    }
                    entry.clone()
                }
                None => (Value::Null, Value::Null, 0),
            },
        };

        let received = Received {
            conn,
            token: frame.token,
            query_type,
            term,
            opts,
            index,
        };
        stats.received.lock().push(received.clone());

        let reply = match query_type {
            SERVER_INFO => Reply::Frames(vec![json!({
                "t": 5,
                "r": [{"id": id, "name": id, "proxy": false}]
            })]),
            NOREPLY_WAIT => Reply::Frames(vec![json!({"t": 4})]),
            STOP => {
                terms.remove(&frame.token);
                Reply::Frames(vec![sequence(Vec::new())])
            }
            _ => handler(&received),
        };

        match reply {
            Reply::Frames(frames) => {
                for body in frames {
                    let bytes = serde_json::to_vec(&body).unwrap_or_default();
                    if write_frame(&mut socket, frame.token, &bytes).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Reply::Silent => {}
            Reply::Hangup => return Ok(()),
        }
    }
}

/// Server side of the V0_4 prelude
async fn accept_legacy(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut word = [0u8; 4];
    socket.read_exact(&mut word).await?;
    socket.read_exact(&mut word).await?;
    let mut key = vec![0u8; u32::from_le_bytes(word) as usize];
    socket.read_exact(&mut key).await?;
    socket.read_exact(&mut word).await?;

    socket.write_all(b"SUCCESS\0").await?;
    socket.flush().await
}

// ==================== Replies ====================

pub fn atom(value: Value) -> Value {
    json!({"t": 1, "r": [value]})
}

pub fn sequence(docs: Vec<Value>) -> Value {
    json!({"t": 2, "r": docs})
}

pub fn partial(docs: Vec<Value>) -> Value {
    json!({"t": 3, "r": docs})
}

/// Partial reply of a sequence changefeed
pub fn feed(docs: Vec<Value>) -> Value {
    json!({"t": 3, "r": docs, "n": [1]})
}

pub fn runtime_error(message: &str) -> Value {
    json!({"t": 18, "e": 4_100_000, "r": [message], "b": []})
}

/// `{"n": i}` for every i in `range`
pub fn numbered(range: std::ops::Range<i64>) -> Vec<Value> {
    range.map(|i| json!({"n": i})).collect()
}

/// Row of the server status table pointing at `server`
pub fn server_status(server: &MockServer) -> Value {
    json!({
        "id": server.id,
        "name": server.id,
        "network": {
            "hostname": "127.0.0.1",
            "reql_port": server.port(),
            "canonical_addresses": [{"host": "127.0.0.1", "port": 0}]
        }
    })
}

// ==================== Helpers ====================

/// Options for the mock servers: legacy handshake, short timeouts
pub fn opts(servers: &[&MockServer]) -> ConnectOpts {
    ConnectOpts {
        addresses: servers.iter().map(|s| s.address()).collect(),
        handshake_version: HandshakeVersion::V0_4,
        timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or two seconds pass
pub async fn eventually<F>(cond: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
