//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use shardlock::cluster::{LocalCluster, LocalClusterConfig};
use shardlock::{ClientError, LockError, RebalanceConfig};

/// Start an in-process cluster with rebalancing off so placement is fixed.
pub fn cluster(shards: usize) -> LocalCluster {
    init_tracing();
    LocalCluster::start(LocalClusterConfig {
        shards,
        replicas: 3,
        frequency_period: Duration::from_secs(3600),
        rebalance: RebalanceConfig {
            enabled: false,
            ..RebalanceConfig::default()
        },
        ..LocalClusterConfig::default()
    })
    .expect("start cluster")
}

/// Cluster whose shards report every `period` and whose master rebalances
/// on small gaps.
pub fn rebalancing_cluster(shards: usize, period: Duration) -> LocalCluster {
    init_tracing();
    LocalCluster::start(LocalClusterConfig {
        shards,
        replicas: 3,
        frequency_period: period,
        rebalance: RebalanceConfig {
            enabled: true,
            imbalance_threshold: 4.0,
            cooldown: period,
            max_locks_per_move: 4,
            ewma_alpha: 1.0,
            transfer_retry: Duration::from_secs(30),
        },
        ..LocalClusterConfig::default()
    })
    .expect("start cluster")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Unwrap a client error into its lock error, panicking on transport faults.
pub fn lock_err(err: ClientError) -> LockError {
    match err {
        ClientError::Lock(err) => err,
        other => panic!("unexpected transport error: {other}"),
    }
}
