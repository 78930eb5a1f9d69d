//! Cluster Tests
//!
//! Seeding, host discovery and query routing across several in-process servers.

mod common;

use std::time::Duration;

use common::*;
use docdb::cluster::discovery::server_status_changes;
use docdb::{Cluster, Context, DriverError, Query};
use serde_json::{json, Map, Value};

fn start(term: Value) -> Query {
    Query::start(term, Map::new())
}

fn is_status_feed(q: &Received) -> bool {
    q.term == server_status_changes()
}

fn node_ids(cluster: &Cluster) -> Vec<String> {
    let mut ids: Vec<String> = cluster.nodes().iter().map(|n| n.id().to_string()).collect();
    ids.sort();
    ids
}

// ============================================================================
// Seeding
// ============================================================================

#[tokio::test]
async fn test_pool_size_per_node() {
    let server = MockServer::echo("alpha").await;
    let mut opts = opts(&[&server]);
    opts.max_open = 2;

    let cluster = Cluster::connect(opts).await.unwrap();
    assert_eq!(server.accepted(), 2);
    assert_eq!(cluster.nodes().len(), 1);
    assert_eq!(cluster.nodes()[0].pool().size(), 2);
    assert!(cluster.is_connected());

    cluster.close();
    assert!(eventually(|| server.closed() == 2).await);
    assert!(!cluster.is_connected());
}

#[tokio::test]
async fn test_seed_that_hangs_up_fails() {
    let server = MockServer::hangup().await;

    let err = Cluster::connect(opts(&[&server])).await.unwrap_err();
    assert!(err.is_connection_error(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_one_reachable_seed_is_enough() {
    let good = MockServer::echo("alpha").await;
    let bad = MockServer::hangup().await;

    let cluster = Cluster::connect(opts(&[&good, &bad])).await.unwrap();
    assert_eq!(node_ids(&cluster), vec!["alpha"]);
    assert_eq!(cluster.host_pool().hosts(), vec![good.host()]);
    assert_eq!(cluster.seeds().len(), 2);
}

#[tokio::test]
async fn test_duplicate_server_is_one_node() {
    let server = MockServer::echo("alpha").await;
    let mut opts = opts(&[&server]);
    // same server under a second name
    opts.addresses.push(format!("localhost:{}", server.port()));

    let cluster = Cluster::connect(opts).await.unwrap();
    assert_eq!(node_ids(&cluster), vec!["alpha"]);
    assert_eq!(cluster.host_pool().hosts().len(), 1);
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let mut opts = docdb::ConnectOpts::default();
    assert!(matches!(
        Cluster::connect(opts.clone()).await,
        Err(DriverError::InvalidConfig(_))
    ));

    opts.address = Some("127.0.0.1:1".to_string());
    opts.host_pool_epsilon = 1.5;
    assert!(matches!(
        Cluster::connect(opts).await,
        Err(DriverError::InvalidConfig(_))
    ));
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_discovery_adds_advertised_servers() {
    let beta = MockServer::echo("beta").await;
    let gamma = MockServer::echo("gamma").await;
    let statuses = vec![json!({"new_val": server_status(&beta)}), json!({"new_val": server_status(&gamma)})];

    let alpha = MockServer::start("alpha", move |q| {
        if is_status_feed(q) && q.index == 0 {
            Reply::Frames(vec![feed(statuses.clone())])
        } else if is_status_feed(q) {
            Reply::Silent
        } else {
            Reply::Frames(vec![atom(json!("alpha"))])
        }
    })
    .await;

    let mut opts = opts(&[&alpha]);
    opts.discover_hosts = true;
    opts.max_open = 2;
    let cluster = Cluster::connect(opts).await.unwrap();

    assert!(eventually(|| cluster.nodes().len() == 3).await);
    assert_eq!(node_ids(&cluster), vec!["alpha", "beta", "gamma"]);
    assert_eq!(cluster.host_pool().hosts().len(), 3);
    assert!(cluster.nodes().iter().all(|n| n.pool().size() == 2));
    assert_eq!(beta.accepted(), 2);
    assert_eq!(gamma.accepted(), 2);

    let node = cluster.node("beta").unwrap();
    assert_eq!(node.host(), &beta.host());
    assert!(node.aliases().is_empty());

    cluster.close();
    assert!(eventually(|| beta.closed() == 2 && gamma.closed() == 2).await);
}

#[tokio::test]
async fn test_discovery_removes_departed_servers() {
    let beta = MockServer::echo("beta").await;
    let added = json!({"new_val": server_status(&beta)});
    let removed = json!({"old_val": server_status(&beta), "new_val": null});

    let alpha = MockServer::start("alpha", move |q| match (is_status_feed(q), q.index) {
        (true, 0) => Reply::Frames(vec![feed(vec![added.clone()])]),
        (true, 1) => Reply::Frames(vec![feed(vec![removed.clone()])]),
        (true, _) => Reply::Silent,
        (false, _) => Reply::Frames(vec![atom(json!("alpha"))]),
    })
    .await;

    let mut opts = opts(&[&alpha]);
    opts.discover_hosts = true;
    let cluster = Cluster::connect(opts).await.unwrap();

    assert!(eventually(|| beta.accepted() == 1).await);
    assert!(eventually(|| node_ids(&cluster) == vec!["alpha"] && beta.closed() == 1).await);
    assert_eq!(cluster.host_pool().hosts(), vec![alpha.host()]);
    assert!(!cluster.has_node("beta"));
}

#[tokio::test]
async fn test_discovery_skips_mismatched_identity() {
    let impostor = MockServer::echo("impostor").await;
    let mut status = server_status(&impostor);
    status["id"] = json!("beta");
    let statuses = vec![json!({"new_val": status})];

    let alpha = MockServer::start("alpha", move |q| {
        if is_status_feed(q) && q.index == 0 {
            Reply::Frames(vec![feed(statuses.clone())])
        } else {
            Reply::Silent
        }
    })
    .await;

    let mut opts = opts(&[&alpha]);
    opts.discover_hosts = true;
    let cluster = Cluster::connect(opts).await.unwrap();

    assert!(eventually(|| impostor.accepted() == 1 && impostor.closed() == 1).await);
    assert_eq!(node_ids(&cluster), vec!["alpha"]);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_retry_on_other_node_after_connection_error() {
    let broken = MockServer::start("alpha", |q| {
        if q.query_type == START {
            Reply::Hangup
        } else {
            Reply::Silent
        }
    })
    .await;
    let healthy = MockServer::echo("beta").await;

    let mut opts = opts(&[&broken, &healthy]);
    opts.host_pool_epsilon = 0.0;
    opts.num_retries = 3;
    let cluster = Cluster::connect(opts).await.unwrap();

    let mut cursor = cluster
        .query(&Context::background(), start(json!(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cursor.next::<String>().await.unwrap(), "beta");

    assert_eq!(broken.count(START), 1);
    assert_eq!(healthy.count(START), 1);
    assert!(cluster.host_pool().score(&broken.host()).unwrap() < 1.0);
    assert_eq!(cluster.host_pool().score(&healthy.host()), Some(1.0));
}

#[tokio::test]
async fn test_retry_never_returns_to_failed_host() {
    let broken = MockServer::start("alpha", |q| {
        if q.query_type == START {
            Reply::Hangup
        } else {
            Reply::Silent
        }
    })
    .await;
    let healthy = MockServer::echo("beta").await;

    for _ in 0..30 {
        let mut opts = opts(&[&broken, &healthy]);
        opts.host_pool_epsilon = 0.5;
        opts.num_retries = 2;
        let cluster = Cluster::connect(opts).await.unwrap();

        let mut cursor = cluster
            .query(&Context::background(), start(json!(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.next::<String>().await.unwrap(), "beta");
        cluster.close();
    }
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let a = MockServer::start("alpha", |_| Reply::Frames(vec![runtime_error("boom")])).await;
    let b = MockServer::start("beta", |_| Reply::Frames(vec![runtime_error("boom")])).await;

    let mut opts = opts(&[&a, &b]);
    opts.num_retries = 3;
    let cluster = Cluster::connect(opts).await.unwrap();

    let err = cluster
        .query(&Context::background(), start(json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Runtime { .. }));
    assert_eq!(a.count(START) + b.count(START), 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let server = MockServer::start("alpha", |_| Reply::Hangup).await;
    let mut opts = opts(&[&server]);
    opts.num_retries = 2;
    let cluster = Cluster::connect(opts).await.unwrap();

    let err = cluster
        .query(&Context::background(), start(json!(1)))
        .await
        .unwrap_err();
    assert!(err.is_connection_error(), "unexpected error: {:?}", err);
    // the second attempt redials the broken connection
    assert_eq!(server.count(START), 2);
}

#[tokio::test]
async fn test_server_and_noreply_wait() {
    let a = MockServer::echo("alpha").await;
    let b = MockServer::echo("beta").await;
    let cluster = Cluster::connect(opts(&[&a, &b])).await.unwrap();
    let ctx = Context::background();

    let info = cluster.server(&ctx).await.unwrap();
    assert!(info.id == "alpha" || info.id == "beta");

    cluster.noreply_wait(&ctx).await.unwrap();
    assert_eq!(a.count(NOREPLY_WAIT), 1);
    assert_eq!(b.count(NOREPLY_WAIT), 1);
}

#[tokio::test]
async fn test_closed_cluster_rejects_queries() {
    let server = MockServer::echo("alpha").await;
    let cluster = Cluster::connect(opts(&[&server])).await.unwrap();

    cluster.close();
    cluster.close();
    assert!(cluster.is_closed());
    assert!(cluster.nodes().is_empty());

    let ctx = Context::with_timeout(Duration::from_secs(1));
    assert!(matches!(
        cluster.query(&ctx, start(json!(1))).await,
        Err(DriverError::Closed("cluster"))
    ));
    assert!(matches!(
        cluster.noreply_wait(&ctx).await,
        Err(DriverError::Closed("cluster"))
    ));
}

#[tokio::test]
async fn test_close_stops_feeds_and_discovery() {
    let alpha = MockServer::start("alpha", |q| match q.index {
        0 if is_status_feed(q) => Reply::Frames(vec![feed(Vec::new())]),
        0 => Reply::Frames(vec![feed(vec![json!({"new_val": {"n": 1}})])]),
        _ => Reply::Silent,
    })
    .await;

    let mut opts = opts(&[&alpha]);
    opts.discover_hosts = true;
    let cluster = Cluster::connect(opts).await.unwrap();
    let feeds = || {
        alpha
            .received()
            .iter()
            .filter(|q| q.query_type == START && is_status_feed(q))
            .count()
    };
    assert!(eventually(|| feeds() == 1).await);

    let cursor = cluster
        .query(&Context::background(), start(json!("changes")))
        .await
        .unwrap()
        .unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Value>(4);
    let handle = cursor.listen(tx);
    assert_eq!(rx.recv().await.unwrap()["new_val"]["n"], 1);

    cluster.close();

    let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(finished.is_ok(), "listener still running after close");
    assert!(rx.recv().await.is_none());
    assert!(eventually(|| alpha.accepted() > 0 && alpha.closed() == alpha.accepted()).await);

    // discovery does not reopen the status feed
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(feeds(), 1);
    assert_eq!(alpha.closed(), alpha.accepted());
}
