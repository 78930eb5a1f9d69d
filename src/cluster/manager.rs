use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use docdb_proto::{Query, ServerResponse};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::{ConnectOpts, Host};
use super::discovery;
use super::host_pool::HostPool;
use super::node::{Node, NodeId};
use crate::context::Context;
use crate::driver::Cursor;
use crate::error::{DriverError, DriverResult};

#[derive(Default)]
struct NodeTable {
    by_id: HashMap<NodeId, Arc<Node>>,
    by_host: HashMap<Host, Arc<Node>>,
}

/// Every known server, and the routing of queries across them
pub struct Cluster {
    pub(super) opts: Arc<ConnectOpts>,
    seeds: Vec<Host>,
    nodes: RwLock<NodeTable>,
    host_pool: HostPool,
    closed: AtomicBool,
    pub(super) shutdown: CancellationToken,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("seeds", &self.seeds)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Connect to the seed hosts and, if enabled, start following the server list.
    ///
    /// Succeeds as long as one seed could be reached.
    pub async fn connect(opts: ConnectOpts) -> DriverResult<Arc<Self>> {
        opts.validate()?;
        let seeds = opts.seeds()?;
        let opts = Arc::new(opts);

        let cluster = Arc::new(Self {
            host_pool: HostPool::new(Vec::new(), opts.host_pool_epsilon, opts.host_decay_duration),
            opts: opts.clone(),
            seeds,
            nodes: RwLock::new(NodeTable::default()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            discovery: Mutex::new(None),
        });

        if let Err(e) = cluster.seed().await {
            cluster.close();
            return Err(e);
        }

        if opts.discover_hosts {
            *cluster.discovery.lock() = Some(discovery::spawn(&cluster));
        }
        Ok(cluster)
    }

    async fn seed(&self) -> DriverResult<()> {
        let results = join_all(
            self.seeds
                .iter()
                .map(|host| Node::connect(host.clone(), self.opts.clone())),
        )
        .await;

        let mut last_err = None;
        for (host, result) in self.seeds.iter().zip(results) {
            match result {
                Ok(node) => {
                    self.add_node(node);
                }
                Err(e) => {
                    warn!("Failed to connect to seed {}: {}", host, e);
                    last_err = Some(e);
                }
            }
        }

        if self.nodes.read().by_id.is_empty() {
            return Err(last_err.unwrap_or(DriverError::NoHosts));
        }
        Ok(())
    }

    // ==================== Membership ====================

    /// Register a connected node. A node whose id is already known is closed instead.
    pub(super) fn add_node(&self, node: Node) -> bool {
        let mut table = self.nodes.write();
        if self.is_closed() || table.by_id.contains_key(node.id()) {
            drop(table);
            debug!("Discarding connection to node {} at {}", node.id(), node.host());
            node.close();
            return false;
        }

        let node = Arc::new(node);
        table.by_host.insert(node.host().clone(), node.clone());
        table.by_id.insert(node.id().to_string(), node.clone());
        drop(table);

        self.host_pool.add_host(node.host().clone());
        debug!("Added node {} ({}) at {}", node.id(), node.name(), node.host());
        true
    }

    pub(super) fn remove_node(&self, id: &str) -> bool {
        let node = {
            let mut table = self.nodes.write();
            let Some(node) = table.by_id.remove(id) else {
                return false;
            };
            table.by_host.retain(|_, n| n.id() != id);
            node
        };

        self.host_pool.remove_host(node.host());
        node.close();
        debug!("Removed node {} at {}", id, node.host());
        true
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.read().by_id.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().by_id.get(id).cloned()
    }

    /// Known nodes, ordered by host
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.read().by_id.values().cloned().collect();
        nodes.sort_by(|a, b| a.host().cmp(b.host()));
        nodes
    }

    fn node_for_host(&self, host: &Host) -> Option<Arc<Node>> {
        self.nodes.read().by_host.get(host).cloned()
    }

    pub fn seeds(&self) -> &[Host] {
        &self.seeds
    }

    pub fn host_pool(&self) -> &HostPool {
        &self.host_pool
    }

    pub fn opts(&self) -> &ConnectOpts {
        &self.opts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && !self.nodes.read().by_id.is_empty()
    }

    // ==================== Queries ====================

    /// Run `op` against the node the host pool picks, moving on to a node not
    /// yet tried after a connection error, up to `num_retries` attempts
    async fn with_node<T, F, Fut>(&self, mut op: F) -> DriverResult<T>
    where
        F: FnMut(Arc<Node>) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let attempts = self.opts.num_retries.max(1);
        let mut last_err = DriverError::NoHosts;
        let mut tried: Vec<Host> = Vec::new();

        for attempt in 1..=attempts {
            if self.is_closed() {
                return Err(DriverError::Closed("cluster"));
            }
            let Some(host) = self.host_pool.get_excluding(&tried) else {
                return Err(last_err);
            };
            tried.push(host.clone());
            let Some(node) = self.node_for_host(&host) else {
                last_err = DriverError::InvalidNode;
                continue;
            };

            match op(node).await {
                Err(e) if e.is_connection_error() => {
                    debug!("Attempt {}/{} on {} failed: {}", attempt, attempts, host, e);
                    self.host_pool.mark(&host, Some(&e));
                    last_err = e;
                }
                Err(DriverError::InvalidNode) => last_err = DriverError::InvalidNode,
                result => {
                    self.host_pool.mark(&host, result.as_ref().err());
                    return result;
                }
            }
        }

        Err(last_err)
    }

    pub async fn query(&self, ctx: &Context, q: Query) -> DriverResult<Option<Cursor>> {
        self.with_node(|node| {
            let q = q.clone();
            async move { node.query(ctx, q).await }
        })
        .await
    }

    pub async fn exec(&self, ctx: &Context, q: Query) -> DriverResult<()> {
        self.with_node(|node| {
            let q = q.clone();
            async move { node.exec(ctx, q).await }
        })
        .await
    }

    pub async fn server(&self, ctx: &Context) -> DriverResult<ServerResponse> {
        self.with_node(|node| async move { node.server(ctx).await })
            .await
    }

    /// Wait for outstanding noreply queries on every node
    pub async fn noreply_wait(&self, ctx: &Context) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::Closed("cluster"));
        }
        let nodes = self.nodes();
        for result in join_all(nodes.iter().map(|n| n.noreply_wait(ctx))).await {
            result?;
        }
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Stop discovery and close every node. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        if let Some(handle) = self.discovery.lock().take() {
            handle.abort();
        }

        let nodes: Vec<Arc<Node>> = {
            let mut table = self.nodes.write();
            table.by_host.clear();
            table.by_id.drain().map(|(_, node)| node).collect()
        };
        for node in nodes {
            node.close();
        }
        self.host_pool.close();
        debug!("Cluster closed");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}
