//! A single multiplexed socket to one server
//!
//! Any number of tasks may call [`Connection::query`] concurrently. Each
//! query is tagged with a fresh token; the dispatcher hands the reply back to
//! the caller through a one-shot promise, or feeds it to the cursor that owns
//! the token once the first reply was partial.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use docdb_proto::{encode_query, Query, QueryType, Response, ResponseType, ServerResponse};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use super::cursor::Cursor;
use super::dispatch::{self, Registry};
use super::handshake;
use crate::cluster::config::{ConnectOpts, Host};
use crate::context::Context;
use crate::error::{DriverError, DriverResult};

/// Byte stream a connection runs over, plain TCP or TLS
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub struct Connection {
    address: Host,
    opts: Arc<ConnectOpts>,
    server: OnceLock<ServerResponse>,
    token: AtomicU64,
    bad: AtomicBool,
    closed: AtomicBool,
    pub(super) registry: Mutex<Registry>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `host`, authenticate, start the background tasks and learn the server identity
    pub async fn connect(host: &Host, opts: Arc<ConnectOpts>) -> DriverResult<Arc<Self>> {
        let handshake = async {
            let mut stream = dial(host, &opts).await?;
            handshake::perform(&mut stream, &opts).await?;
            Ok::<_, DriverError>(stream)
        };
        let stream = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, handshake).await.map_err(|_| {
                DriverError::Connection(format!("connecting to {} timed out", host))
            })??,
            None => handshake.await?,
        };

        let conn = Self::start(host.clone(), opts.clone(), stream);

        let ctx = Context::background().or_timeout(opts.timeout.or(opts.read_timeout));
        match conn.fetch_server_info(&ctx).await {
            Ok(info) => {
                debug!("Connected to {} ({} / {})", host, info.name, info.id);
                let _ = conn.server.set(info);
                Ok(conn)
            }
            Err(e) => {
                conn.close();
                Err(e)
            }
        }
    }

    /// Wrap an authenticated stream and spawn its writer, reader and dispatcher
    pub(crate) fn start(address: Host, opts: Arc<ConnectOpts>, stream: Box<dyn AsyncStream>) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let conn = Arc::new(Self {
            address,
            opts: opts.clone(),
            server: OnceLock::new(),
            token: AtomicU64::new(0),
            bad: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
            writes: write_tx,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(dispatch::write_loop(
            writer,
            write_rx,
            frame_tx.clone(),
            opts.write_timeout,
            shutdown.clone(),
        ));
        tokio::spawn(dispatch::read_loop(reader, frame_tx, shutdown.clone()));
        tokio::spawn(dispatch::dispatch_loop(
            Arc::downgrade(&conn),
            frame_rx,
            shutdown,
        ));

        conn
    }

    pub fn address(&self) -> &Host {
        &self.address
    }

    /// Identity reported by the server right after the handshake
    pub fn server_info(&self) -> Option<&ServerResponse> {
        self.server.get()
    }

    pub(crate) fn opts(&self) -> &ConnectOpts {
        &self.opts
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Promises and cursors currently registered
    pub fn in_flight(&self) -> (usize, usize) {
        self.registry.lock().len()
    }

    fn next_token(&self) -> u64 {
        self.token.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ==================== Queries ====================

    /// Send `q` and wait for its first reply.
    ///
    /// Returns the reply (its documents moved into the cursor) and, for
    /// successful queries, a cursor over the results. Noreply queries return
    /// `(None, None)` as soon as they are queued.
    pub async fn query(
        self: &Arc<Self>,
        ctx: &Context,
        mut q: Query,
    ) -> DriverResult<(Option<Response>, Option<Cursor>)> {
        if self.is_closed() {
            return Err(DriverError::Closed("connection"));
        }
        if self.is_bad() {
            return Err(DriverError::ConnectionClosed);
        }

        if q.query_type.allocates_token() {
            q.token = self.next_token();
        }

        if self.opts.use_opentracing {
            let span = info_span!(
                "docdb.query",
                address = %self.address,
                token = q.token,
                query_type = ?q.query_type
            );
            self.run_query(ctx, q).instrument(span).await
        } else {
            self.run_query(ctx, q).await
        }
    }

    async fn run_query(
        self: &Arc<Self>,
        ctx: &Context,
        q: Query,
    ) -> DriverResult<(Option<Response>, Option<Cursor>)> {
        let frame = encode_query(&q)?;

        if q.is_noreply() {
            self.enqueue(frame)?;
            return Ok((None, None));
        }

        let promise = self.registry.lock().register_promise(q.token)?;
        if let Err(e) = self.enqueue(frame) {
            self.registry.lock().cancel_promise(q.token);
            return Err(e);
        }

        let wait = ctx.or_timeout(self.opts.read_timeout);
        let response = tokio::select! {
            result = promise => match result {
                Ok(response) => response?,
                Err(_) => return Err(DriverError::ConnectionClosed),
            },
            _ = wait.done() => {
                self.registry.lock().cancel_promise(q.token);
                if q.query_type == QueryType::Start {
                    let _ = self.send_stop(q.token);
                }
                return Err(wait.error());
            }
        };

        self.process_response(ctx, q, response)
    }

    fn process_response(
        self: &Arc<Self>,
        ctx: &Context,
        q: Query,
        mut response: Response,
    ) -> DriverResult<(Option<Response>, Option<Cursor>)> {
        match response.response_type() {
            Some(ResponseType::SuccessAtom)
            | Some(ResponseType::SuccessSequence)
            | Some(ResponseType::ServerInfo) => {
                let cursor = Cursor::from_response(ctx.clone(), self, &q, &mut response, true);
                Ok((Some(response), Some(cursor)))
            }
            Some(ResponseType::SuccessPartial) => {
                let cursor = Cursor::from_response(ctx.clone(), self, &q, &mut response, false);
                self.registry
                    .lock()
                    .register_cursor(q.token, cursor.shared())?;
                Ok((Some(response), Some(cursor)))
            }
            Some(ResponseType::WaitComplete) => {
                self.remove_cursor(q.token);
                Ok((Some(response), None))
            }
            Some(kind) if kind.is_error() => {
                self.remove_cursor(q.token);
                Err(DriverError::from_response(&response, q.term.as_ref()))
            }
            _ => {
                self.fail(DriverError::Driver(format!(
                    "unexpected response type {} from {}",
                    response.type_code, self.address
                )));
                Err(DriverError::Driver(format!(
                    "unexpected response type: {}",
                    response.type_code
                )))
            }
        }
    }

    /// Run `q` and discard its results
    pub async fn exec(self: &Arc<Self>, ctx: &Context, q: Query) -> DriverResult<()> {
        if let (_, Some(mut cursor)) = self.query(ctx, q).await? {
            cursor.close().await;
        }
        Ok(())
    }

    /// Wait until the server has processed every noreply query sent on this connection
    pub async fn noreply_wait(self: &Arc<Self>, ctx: &Context) -> DriverResult<()> {
        let (response, _) = self.query(ctx, Query::noreply_wait()).await?;
        match response.and_then(|r| r.response_type()) {
            Some(ResponseType::WaitComplete) => Ok(()),
            other => Err(DriverError::Driver(format!(
                "unexpected response to noreply wait: {:?}",
                other
            ))),
        }
    }

    /// Ask the server for its identity
    pub async fn server(self: &Arc<Self>, ctx: &Context) -> DriverResult<ServerResponse> {
        self.fetch_server_info(ctx).await
    }

    async fn fetch_server_info(self: &Arc<Self>, ctx: &Context) -> DriverResult<ServerResponse> {
        match self.query(ctx, Query::server_info()).await? {
            (_, Some(mut cursor)) => cursor
                .try_next::<ServerResponse>()
                .await?
                .ok_or_else(|| DriverError::Driver("empty server info response".to_string())),
            _ => Err(DriverError::Driver("no server info response".to_string())),
        }
    }

    // ==================== Cursor support ====================

    fn enqueue(&self, frame: Vec<u8>) -> DriverResult<()> {
        self.writes
            .send(frame)
            .map_err(|_| DriverError::ConnectionClosed)
    }

    pub(super) fn send_continue(&self, token: u64) -> DriverResult<()> {
        self.enqueue(encode_query(&Query::continue_query(token))?)
    }

    pub(super) fn send_stop(&self, token: u64) -> DriverResult<()> {
        self.enqueue(encode_query(&Query::stop(token))?)
    }

    pub(super) fn remove_cursor(&self, token: u64) {
        self.registry.lock().remove_cursor(token);
    }

    pub(super) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ==================== Lifecycle ====================

    /// Mark the connection bad, stop its tasks and fail everything waiting on it
    pub(super) fn fail(&self, err: DriverError) {
        self.bad.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.fail_all(err);
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing connection to {}", self.address);
        self.fail(DriverError::ConnectionClosed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.fail_all(DriverError::ConnectionClosed);
    }
}

async fn dial(host: &Host, opts: &ConnectOpts) -> DriverResult<Box<dyn AsyncStream>> {
    let addr = host.to_string();
    let tcp = TcpStream::connect(addr.as_str())
        .await
        .map_err(|e| DriverError::Connection(format!("failed to connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(opts.keep_alive_period);
    SockRef::from(&tcp).set_tcp_keepalive(&keepalive)?;

    match &opts.tls_config {
        Some(config) => {
            let name = ServerName::try_from(host.name.clone()).map_err(|e| {
                DriverError::InvalidConfig(format!("invalid TLS server name {}: {}", host.name, e))
            })?;
            let tls = TlsConnector::from(config.clone())
                .connect(name, tcp)
                .await
                .map_err(|e| DriverError::Connection(format!("TLS handshake with {} failed: {}", addr, e)))?;
            Ok(Box::new(tls))
        }
        None => Ok(Box::new(tcp)),
    }
}
