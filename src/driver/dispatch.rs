//! Background tasks of a connection
//!
//! One writer task owns the write half of the socket, one reader task owns
//! the read half, and a dispatcher routes decoded responses to the promise
//! or cursor registered for their token. Frames whose token matches neither
//! belong to queries that were cancelled and are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use docdb_proto::{decode_response, read_frame, Frame, ProtocolError, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::Connection;
use super::cursor::CursorShared;
use crate::error::{DriverError, DriverResult};

pub(super) type FrameResult = Result<Frame, ProtocolError>;
pub(super) type Promise = oneshot::Sender<DriverResult<Response>>;

/// Who is waiting on which token
#[derive(Default)]
pub(super) struct Registry {
    pending: HashMap<u64, Promise>,
    cursors: HashMap<u64, Arc<CursorShared>>,
    /// Set once the connection failed or closed; nothing registers after that
    closed: bool,
}

impl Registry {
    pub(super) fn register_promise(
        &mut self,
        token: u64,
    ) -> DriverResult<oneshot::Receiver<DriverResult<Response>>> {
        if self.closed {
            return Err(DriverError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);
        Ok(rx)
    }

    pub(super) fn cancel_promise(&mut self, token: u64) {
        self.pending.remove(&token);
    }

    pub(super) fn register_cursor(
        &mut self,
        token: u64,
        cursor: Arc<CursorShared>,
    ) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::ConnectionClosed);
        }
        self.cursors.insert(token, cursor);
        Ok(())
    }

    pub(super) fn remove_cursor(&mut self, token: u64) -> Option<Arc<CursorShared>> {
        self.cursors.remove(&token)
    }

    pub(super) fn len(&self) -> (usize, usize) {
        (self.pending.len(), self.cursors.len())
    }

    fn drain(&mut self) -> (Vec<Promise>, Vec<Arc<CursorShared>>) {
        self.closed = true;
        (
            self.pending.drain().map(|(_, p)| p).collect(),
            self.cursors.drain().map(|(_, c)| c).collect(),
        )
    }
}

// ==================== Tasks ====================

pub(super) async fn write_loop<W>(
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<Vec<u8>>,
    errors: mpsc::UnboundedSender<FrameResult>,
    write_timeout: Option<Duration>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = requests.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let result = match write_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                )),
            },
            None => write.await,
        };

        if let Err(e) = result {
            let _ = errors.send(Err(ProtocolError::Io(e)));
            break;
        }
    }

    let _ = writer.shutdown().await;
}

pub(super) async fn read_loop<R>(
    mut reader: R,
    frames: mpsc::UnboundedSender<FrameResult>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = read_frame(&mut reader) => {
                let failed = result.is_err();
                if frames.send(result).is_err() || failed {
                    break;
                }
            }
        }
    }
}

pub(super) async fn dispatch_loop(
    conn: Weak<Connection>,
    mut frames: mpsc::UnboundedReceiver<FrameResult>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break DriverError::ConnectionClosed,
            next = frames.recv() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break DriverError::from(e),
            None => break DriverError::ConnectionClosed,
        };

        let Some(conn) = conn.upgrade() else {
            return;
        };
        if let Err(e) = conn.dispatch(frame) {
            break e;
        }
    };

    if let Some(conn) = conn.upgrade() {
        if !conn.is_closed() {
            debug!("Connection to {} failed: {}", conn.address(), reason);
        }
        conn.fail(reason);
    }
}

// ==================== Routing ====================

impl Connection {
    /// Route one frame to its waiter. An error here is fatal for the connection.
    pub(super) fn dispatch(&self, frame: Frame) -> DriverResult<()> {
        let token = frame.token;
        let response = decode_response(token, &frame.body).map_err(|e| {
            warn!("Malformed response for token {} from {}: {}", token, self.address(), e);
            DriverError::Driver(format!("malformed response for token {}: {}", token, e))
        })?;

        let cursor = {
            let mut registry = self.registry.lock();
            if let Some(promise) = registry.pending.remove(&token) {
                drop(registry);
                let _ = promise.send(Ok(response));
                return Ok(());
            }
            registry.cursors.get(&token).cloned()
        };

        match cursor {
            Some(cursor) => {
                if cursor.extend(response) {
                    self.registry.lock().remove_cursor(token);
                }
            }
            None => trace!("Discarding response for unknown token {}", token),
        }
        Ok(())
    }

    /// Resolve every waiter with `err` and refuse new registrations
    pub(super) fn fail_all(&self, err: DriverError) {
        let (pending, cursors) = self.registry.lock().drain();
        for promise in pending {
            let _ = promise.send(Err(err.clone()));
        }
        for cursor in cursors {
            cursor.fail(err.clone());
        }
    }
}
