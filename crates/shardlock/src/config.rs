//! Configuration for shard, master, and client.
//!
//! Every struct has a usable `Default`; `from_env` layers `SHARDLOCK_*`
//! overrides on top. Invalid or non-positive values are ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardlock_rsm::rsm::{GroupId, ServerAddr};

/// A shard replica group known to the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub id: GroupId,
    pub servers: Vec<ServerAddr>,
}

#[derive(Clone, Debug)]
pub struct ShardConfig {
    /// Id this shard reports itself as in master notifications.
    pub group: GroupId,
    /// Master group addresses; seeds the replicated list that reports go to.
    pub master: Vec<ServerAddr>,
    /// Length of one frequency measurement window.
    pub frequency_period: Duration,
}

impl ShardConfig {
    pub fn new(group: GroupId, master: Vec<ServerAddr>) -> Self {
        Self {
            group,
            master,
            frequency_period: Duration::from_secs(1),
        }
    }

    pub fn from_env(group: GroupId, master: Vec<ServerAddr>) -> Self {
        let mut cfg = Self::new(group, master);
        if let Some(ms) = parse_positive_env_u64("SHARDLOCK_FREQUENCY_PERIOD_MS") {
            cfg.frequency_period = Duration::from_millis(ms);
        }
        cfg
    }
}

/// Rebalancing and migration policy applied by the master.
#[derive(Clone, Copy, Debug)]
pub struct RebalanceConfig {
    pub enabled: bool,
    /// Minimum hot-minus-cold load gap that triggers a migration.
    pub imbalance_threshold: f64,
    /// Minimum commit-time spacing between two planned migrations.
    pub cooldown: Duration,
    /// Upper bound on locks moved by one plan when no domain fits.
    pub max_locks_per_move: usize,
    /// Weight of the newest report in the per-shard moving average.
    pub ewma_alpha: f64,
    /// Age after which a pending migration's `TransferRequest` is sent again.
    /// Applies to forced migrations too.
    pub transfer_retry: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            imbalance_threshold: 50.0,
            cooldown: Duration::from_secs(2),
            max_locks_per_move: 8,
            ewma_alpha: 0.5,
            transfer_retry: Duration::from_secs(5),
        }
    }
}

impl RebalanceConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(enabled) = parse_env_bool("SHARDLOCK_REBALANCE_ENABLED") {
            cfg.enabled = enabled;
        }
        if let Some(threshold) = parse_positive_env_f64("SHARDLOCK_REBALANCE_THRESHOLD") {
            cfg.imbalance_threshold = threshold;
        }
        if let Some(ms) = parse_positive_env_u64("SHARDLOCK_REBALANCE_COOLDOWN_MS") {
            cfg.cooldown = Duration::from_millis(ms);
        }
        if let Some(max) = parse_positive_env_u64("SHARDLOCK_REBALANCE_MAX_LOCKS") {
            cfg.max_locks_per_move = usize::try_from(max).unwrap_or(usize::MAX);
        }
        if let Some(alpha) = parse_positive_env_f64("SHARDLOCK_REBALANCE_ALPHA") {
            cfg.ewma_alpha = alpha.min(1.0);
        }
        if let Some(ms) = parse_positive_env_u64("SHARDLOCK_TRANSFER_RETRY_MS") {
            cfg.transfer_retry = Duration::from_millis(ms);
        }
        cfg
    }
}

#[derive(Clone, Debug, Default)]
pub struct MasterConfig {
    pub groups: Vec<ShardGroup>,
    pub rebalance: RebalanceConfig,
}

impl MasterConfig {
    pub fn new(groups: Vec<ShardGroup>) -> Self {
        Self {
            groups,
            rebalance: RebalanceConfig::default(),
        }
    }

    pub fn from_env(groups: Vec<ShardGroup>) -> Self {
        Self {
            groups,
            rebalance: RebalanceConfig::from_env(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Well-known master group addresses.
    pub master: Vec<ServerAddr>,
}

impl ClientConfig {
    pub fn new(master: Vec<ServerAddr>) -> Self {
        Self { master }
    }

    /// `SHARDLOCK_MASTER` holds a comma-separated address list and replaces
    /// `master` when set.
    pub fn from_env(master: Vec<ServerAddr>) -> Self {
        let master = std::env::var("SHARDLOCK_MASTER")
            .ok()
            .map(|raw| parse_addr_list(&raw))
            .filter(|addrs| !addrs.is_empty())
            .unwrap_or(master);
        Self { master }
    }
}

pub fn parse_addr_list(raw: &str) -> Vec<ServerAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(ServerAddr::from)
        .collect()
}

fn parse_positive_env_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn parse_positive_env_f64(var_name: &str) -> Option<f64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
}

fn parse_env_bool(var_name: &str) -> Option<bool> {
    let raw = std::env::var(var_name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
