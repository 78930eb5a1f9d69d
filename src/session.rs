//! Entry point for applications

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use docdb_proto::{Query, ServerResponse};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cluster::{Cluster, ConnectOpts, Node};
use crate::context::Context;
use crate::driver::Cursor;
use crate::error::{DriverError, DriverResult};
use crate::executor::QueryExecutor;

/// A connected cluster plus the per-session default database
pub struct Session {
    opts: ConnectOpts,
    cluster: RwLock<Option<Arc<Cluster>>>,
    database: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl Session {
    pub async fn connect(opts: ConnectOpts) -> DriverResult<Self> {
        let cluster = Cluster::connect(opts.clone()).await?;
        Ok(Self {
            database: RwLock::new(opts.database.clone()),
            opts,
            cluster: RwLock::new(Some(cluster)),
            closed: AtomicBool::new(false),
        })
    }

    /// Close the current cluster and connect again with the same options
    pub async fn reconnect(&self) -> DriverResult<()> {
        if let Some(old) = self.cluster.write().take() {
            old.close();
        }

        let cluster = Cluster::connect(self.opts.clone()).await?;
        *self.cluster.write() = Some(cluster);
        self.closed.store(false, Ordering::Release);
        debug!("Session reconnected");
        Ok(())
    }

    /// Close every connection. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cluster) = self.cluster.write().take() {
            cluster.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self
                .cluster
                .read()
                .as_ref()
                .is_some_and(|c| c.is_connected())
    }

    /// Default database for queries that do not name one
    pub fn use_database(&self, database: impl Into<String>) {
        *self.database.write() = Some(database.into());
    }

    pub fn database(&self) -> Option<String> {
        self.database.read().clone()
    }

    pub fn opts(&self) -> &ConnectOpts {
        &self.opts
    }

    /// The cluster behind this session
    pub fn cluster(&self) -> DriverResult<Arc<Cluster>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed("session"));
        }
        self.cluster
            .read()
            .clone()
            .ok_or(DriverError::Closed("session"))
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.cluster().map(|c| c.nodes()).unwrap_or_default()
    }

    /// START query for `term` carrying the session's default database
    pub fn new_query(&self, term: Value, opts: Map<String, Value>) -> Query {
        Query::start(term, opts).with_default_db(self.database().as_deref())
    }

    pub async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        let q = q.with_default_db(self.database().as_deref());
        self.cluster()?.query(ctx, q).await
    }

    pub async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        let q = q.with_default_db(self.database().as_deref());
        self.cluster()?.exec(ctx, q).await
    }

    pub async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        self.cluster()?.server(ctx).await
    }

    pub async fn noreply_wait(&self, ctx: &Context) -> DriverResult<()> {
        self.cluster()?.noreply_wait(ctx).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl QueryExecutor for Session {
    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        Session::query(self, ctx, q).await
    }

    async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        Session::exec(self, ctx, q).await
    }

    async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        Session::server(self, ctx).await
    }

    fn new_query(&self, term: Value, opts: Map<String, Value>) -> Query {
        Session::new_query(self, term, opts)
    }
}
