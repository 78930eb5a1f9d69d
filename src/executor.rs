use async_trait::async_trait;
use docdb_proto::{Query, ServerResponse};
use serde_json::{Map, Value};

use crate::cluster::{Cluster, Node};
use crate::context::Context;
use crate::driver::{Cursor, Pool};
use crate::error::DriverResult;

/// Anything that can run a query: a session, a cluster, a single node or
/// pool, or a [`crate::mock::Mock`] in tests
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>>;

    async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        if let Some(mut cursor) = self.query(ctx, q).await? {
            cursor.close().await;
        }
        Ok(())
    }

    async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse>;

    /// START query for `term`
    fn new_query(&self, term: Value, opts: Map<String, Value>) -> Query {
        Query::start(term, opts)
    }
}

#[async_trait]
impl QueryExecutor for Cluster {
    fn is_connected(&self) -> bool {
        Cluster::is_connected(self)
    }

    async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        Cluster::query(self, ctx, q).await
    }

    async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        Cluster::exec(self, ctx, q).await
    }

    async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        Cluster::server(self, ctx).await
    }

    fn new_query(&self, term: Value, opts: Map<String, Value>) -> Query {
        Query::start(term, opts).with_default_db(self.opts().database.as_deref())
    }
}

#[async_trait]
impl QueryExecutor for Node {
    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        Node::query(self, ctx, q).await
    }

    async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        Node::exec(self, ctx, q).await
    }

    async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        Node::server(self, ctx).await
    }
}

#[async_trait]
impl QueryExecutor for Pool {
    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        Pool::query(self, ctx, q).await
    }

    async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        Pool::exec(self, ctx, q).await
    }

    async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        Pool::server(self, ctx).await
    }
}
