//! Follows the server status changefeed to keep the node table current

use std::sync::{Arc, Weak};
use std::time::Duration;

use docdb_proto::Query;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use super::config::{Host, DEFAULT_PORT};
use super::manager::Cluster;
use super::node::Node;
use crate::context::Context;
use crate::error::{DriverError, DriverResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `r.db("rethinkdb").table("server_status").changes({include_initial: true})`
pub fn server_status_changes() -> Value {
    const DB: i64 = 14;
    const TABLE: i64 = 15;
    const CHANGES: i64 = 152;
    json!([
        CHANGES,
        [[TABLE, [[DB, ["rethinkdb"]], "server_status"]]],
        {"include_initial": true}
    ])
}

/// Row of the `server_status` system table
#[derive(Debug, Clone, Deserialize)]
pub struct ServerStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network: NetworkStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkStatus {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub reql_port: u16,
    #[serde(default)]
    pub canonical_addresses: Vec<CanonicalAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanonicalAddress {
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl ServerStatus {
    /// Addresses to try for this server: every canonical address, then the hostname,
    /// all on the query port
    pub fn candidates(&self) -> Vec<Host> {
        let port = match self.network.reql_port {
            0 => DEFAULT_PORT,
            port => port,
        };

        let mut hosts: Vec<Host> = Vec::new();
        let names = self
            .network
            .canonical_addresses
            .iter()
            .map(|a| a.host.as_str())
            .chain(std::iter::once(self.network.hostname.as_str()));
        for name in names {
            let host = Host::new(name, port);
            if !name.is_empty() && !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    #[serde(default)]
    new_val: Option<ServerStatus>,
    #[serde(default)]
    old_val: Option<ServerStatus>,
}

pub(super) fn spawn(cluster: &Arc<Cluster>) -> JoinHandle<()> {
    let weak = Arc::downgrade(cluster);
    let shutdown = cluster.shutdown.clone();
    tokio::spawn(run(weak, shutdown).instrument(debug_span!("docdb.discovery")))
}

async fn run(cluster: Weak<Cluster>, shutdown: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = follow(&cluster, &shutdown).await;
        if shutdown.is_cancelled() || cluster.strong_count() == 0 {
            break;
        }

        match result {
            Ok(()) => {
                debug!("Server status feed ended, restarting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!("Host discovery failed, retrying in {:?}: {}", backoff, e);
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    debug!("Host discovery stopped");
}

/// Open the feed and apply changes until it ends. Holds the cluster only
/// while applying a change.
async fn follow(cluster: &Weak<Cluster>, shutdown: &CancellationToken) -> DriverResult<()> {
    let ctx = Context::from_token(shutdown.child_token());

    let mut cursor = {
        let cluster = cluster.upgrade().ok_or(DriverError::Closed("cluster"))?;
        cluster
            .query(&ctx, Query::start(server_status_changes(), Map::new()))
            .await?
            .ok_or_else(|| DriverError::Driver("server status feed returned no cursor".to_string()))?
    };

    while let Some(change) = cursor.try_next::<StatusChange>().await? {
        let Some(cluster) = cluster.upgrade() else {
            break;
        };
        cluster.apply_change(change).await;
    }

    cursor.close().await;
    Ok(())
}

impl Cluster {
    async fn apply_change(&self, change: StatusChange) {
        match (change.new_val, change.old_val) {
            (Some(status), _) => {
                if !self.has_node(&status.id) {
                    self.connect_discovered(status).await;
                }
            }
            (None, Some(status)) => {
                self.remove_node(&status.id);
            }
            (None, None) => {}
        }
    }

    async fn connect_discovered(&self, status: ServerStatus) {
        let candidates = status.candidates();
        for host in &candidates {
            match Node::connect(host.clone(), self.opts.clone()).await {
                Ok(node) if node.id() == status.id => {
                    self.add_node(node.with_aliases(candidates.clone()));
                    return;
                }
                Ok(node) => {
                    warn!(
                        "{} answered as server {} instead of {}",
                        host,
                        node.id(),
                        status.id
                    );
                    node.close();
                }
                Err(e) => debug!("Could not reach server {} at {}: {}", status.id, host, e),
            }
        }
        warn!(
            "Failed to connect to discovered server {} ({})",
            status.name, status.id
        );
    }
}
