use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use docdb_proto::{Query, ServerResponse};
use tracing::debug;

use super::config::{ConnectOpts, Host};
use crate::context::Context;
use crate::driver::{Cursor, Pool};
use crate::error::{DriverError, DriverResult};

/// Unique identifier of a server, as reported by its server info
pub type NodeId = String;

/// One server of the cluster and the pool of connections to it
pub struct Node {
    id: NodeId,
    name: String,
    host: Host,
    aliases: Vec<Host>,
    pool: Pool,
    closed: AtomicBool,
}

impl Node {
    pub async fn connect(host: Host, opts: Arc<ConnectOpts>) -> DriverResult<Self> {
        let pool = Pool::connect(host.clone(), opts).await?;
        let ServerResponse { id, name, .. } = pool.server_info().clone();

        Ok(Self {
            id,
            name,
            host,
            aliases: Vec::new(),
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// Other addresses the server advertises
    pub fn with_aliases(mut self, aliases: Vec<Host>) -> Self {
        self.aliases = aliases.into_iter().filter(|h| *h != self.host).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn aliases(&self) -> &[Host] {
        &self.aliases
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check(&self) -> DriverResult<()> {
        if self.is_closed() {
            Err(DriverError::InvalidNode)
        } else {
            Ok(())
        }
    }

    pub async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        self.check()?;
        self.pool.query(ctx, q).await
    }

    pub async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        self.check()?;
        self.pool.exec(ctx, q).await
    }

    pub async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        self.check()?;
        self.pool.server(ctx).await
    }

    pub async fn noreply_wait(&self, ctx: &Context) -> DriverResult<()> {
        self.check()?;
        self.pool.noreply_wait(ctx).await
    }

    /// Close the node and its pool. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing node {} at {}", self.id, self.host);
        self.pool.close();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("aliases", &self.aliases)
            .field("closed", &self.is_closed())
            .finish()
    }
}
