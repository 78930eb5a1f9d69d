//! Fixed set of connections to one server
//!
//! Queries rotate over the slots round-robin. A slot whose connection went
//! bad is redialed the next time the rotation reaches it; the query that hit
//! the failure has already reported it to the caller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use docdb_proto::{Query, ServerResponse};
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::debug;

use super::connection::Connection;
use super::cursor::Cursor;
use crate::cluster::config::{ConnectOpts, Host};
use crate::context::Context;
use crate::error::{DriverError, DriverResult};

pub struct Pool {
    host: Host,
    opts: Arc<ConnectOpts>,
    /// Slot contents may be swapped on redial, the slot count never changes
    slots: Vec<Mutex<Arc<Connection>>>,
    next_index: AtomicUsize,
    server: ServerResponse,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Open one connection, learn the server identity, then open the rest.
    /// Fails as a whole if any connection fails.
    pub async fn connect(host: Host, opts: Arc<ConnectOpts>) -> DriverResult<Self> {
        let first = Connection::connect(&host, opts.clone()).await?;
        let server = match first.server_info() {
            Some(info) => info.clone(),
            None => {
                first.close();
                return Err(DriverError::Driver(format!(
                    "no server identity from {}",
                    host
                )));
            }
        };

        let size = opts.pool_size();
        let rest = join_all((1..size).map(|_| Connection::connect(&host, opts.clone()))).await;

        let mut conns = vec![first];
        let mut failure = None;
        for result in rest {
            match result {
                Ok(conn) => conns.push(conn),
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        if let Some(e) = failure {
            for conn in &conns {
                conn.close();
            }
            return Err(e);
        }

        debug!("Opened pool of {} connections to {}", size, host);
        Ok(Self {
            host,
            opts,
            slots: conns.into_iter().map(Mutex::new).collect(),
            next_index: AtomicUsize::new(0),
            server,
            closed: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Identity of the server behind this pool
    pub fn server_info(&self) -> &ServerResponse {
        &self.server
    }

    /// Connection in the next slot, redialed first if it went bad
    pub async fn next(&self) -> DriverResult<Arc<Connection>> {
        if self.is_closed() {
            return Err(DriverError::Closed("pool"));
        }

        let index = self.next_index.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let current = self.slots[index].lock().clone();
        if !current.is_bad() {
            return Ok(current);
        }

        debug!("Redialing bad connection {} to {}", index, self.host);
        let fresh = Connection::connect(&self.host, self.opts.clone()).await?;

        let mut slot = self.slots[index].lock();
        if self.is_closed() {
            drop(slot);
            fresh.close();
            return Err(DriverError::Closed("pool"));
        }
        if Arc::ptr_eq(&*slot, &current) {
            *slot = fresh.clone();
            drop(slot);
            current.close();
            Ok(fresh)
        } else {
            // another caller replaced it first
            let winner = slot.clone();
            drop(slot);
            fresh.close();
            Ok(winner)
        }
    }

    pub async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        let conn = self.next().await?;
        let (_, cursor) = conn.query(ctx, q).await?;
        Ok(cursor)
    }

    pub async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        let conn = self.next().await?;
        conn.exec(ctx, q).await
    }

    pub async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        let conn = self.next().await?;
        conn.server(ctx).await
    }

    /// Wait for outstanding noreply queries on every slot
    pub async fn noreply_wait(&self, ctx: &Context) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::Closed("pool"));
        }
        let conns: Vec<Arc<Connection>> = self.slots.iter().map(|s| s.lock().clone()).collect();
        for result in join_all(conns.iter().map(|c| c.noreply_wait(ctx))).await {
            result?;
        }
        Ok(())
    }

    /// Close every slot. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            slot.lock().close();
        }
        debug!("Closed pool to {}", self.host);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}
