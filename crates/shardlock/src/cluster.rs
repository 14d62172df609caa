//! In-process cluster: one master group plus N shard groups wired on a
//! [`LocalNetwork`]. Used by the integration tests and the workload driver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shardlock_rsm::rsm::{
    GroupId, LocalGroup, LocalGroupConfig, LocalNetwork, LocalTransport, ServerAddr, StateMachine,
};

use crate::client::LockClient;
use crate::config::{ClientConfig, MasterConfig, RebalanceConfig, ShardConfig, ShardGroup};
use crate::master::MasterStateMachine;
use crate::shard::ShardStateMachine;

/// Group id used for the master group.
pub const MASTER_GROUP: GroupId = 0;

#[derive(Clone, Debug)]
pub struct LocalClusterConfig {
    pub shards: usize,
    pub replicas: usize,
    pub frequency_period: Duration,
    pub rebalance: RebalanceConfig,
    pub group: LocalGroupConfig,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            shards: 3,
            replicas: 3,
            frequency_period: Duration::from_secs(1),
            rebalance: RebalanceConfig::default(),
            group: LocalGroupConfig::default(),
        }
    }
}

struct ShardHandle {
    group: Arc<LocalGroup>,
    replicas: Vec<Arc<ShardStateMachine>>,
}

pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    master_group: Arc<LocalGroup>,
    master_replicas: Vec<Arc<MasterStateMachine>>,
    shards: BTreeMap<GroupId, ShardHandle>,
}

impl LocalCluster {
    pub fn start(cfg: LocalClusterConfig) -> anyhow::Result<Self> {
        if cfg.shards == 0 || cfg.replicas == 0 {
            anyhow::bail!("cluster needs at least one shard and one replica");
        }
        let network = LocalNetwork::new();
        let master_addrs = (0..cfg.replicas)
            .map(|r| ServerAddr::new(format!("master-{r}")))
            .collect::<Vec<_>>();

        let mut shard_groups = Vec::with_capacity(cfg.shards);
        let mut shards = BTreeMap::new();
        for id in 1..=cfg.shards as GroupId {
            let servers = (0..cfg.replicas)
                .map(|r| ServerAddr::new(format!("shard-{id}-{r}")))
                .collect::<Vec<_>>();
            let replicas = (0..cfg.replicas)
                .map(|_| {
                    let mut shard_cfg = ShardConfig::new(id, master_addrs.clone());
                    shard_cfg.frequency_period = cfg.frequency_period;
                    Arc::new(ShardStateMachine::new(shard_cfg))
                })
                .collect::<Vec<_>>();
            let group = network
                .add_group(id, servers.clone(), as_state_machines(&replicas), cfg.group)
                .with_context(|| format!("register shard group {id}"))?;
            shard_groups.push(ShardGroup { id, servers });
            shards.insert(id, ShardHandle { group, replicas });
        }

        let master_replicas = (0..cfg.replicas)
            .map(|_| {
                Arc::new(MasterStateMachine::new(MasterConfig {
                    groups: shard_groups.clone(),
                    rebalance: cfg.rebalance,
                }))
            })
            .collect::<Vec<_>>();
        let master_group = network
            .add_group(
                MASTER_GROUP,
                master_addrs,
                as_state_machines(&master_replicas),
                cfg.group,
            )
            .context("register master group")?;
        tracing::info!(shards = cfg.shards, replicas = cfg.replicas, "local cluster started");
        Ok(Self {
            network,
            master_group,
            master_replicas,
            shards,
        })
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn master_addrs(&self) -> Vec<ServerAddr> {
        self.master_group.servers().to_vec()
    }

    pub fn master_group(&self) -> &Arc<LocalGroup> {
        &self.master_group
    }

    /// Replica 0 of the master group.
    pub fn master(&self) -> &MasterStateMachine {
        &self.master_replicas[0]
    }

    pub fn shard_ids(&self) -> Vec<GroupId> {
        self.shards.keys().copied().collect()
    }

    pub fn shard_group(&self, id: GroupId) -> Option<&Arc<LocalGroup>> {
        self.shards.get(&id).map(|shard| &shard.group)
    }

    /// Replica 0 of shard `id`.
    pub fn shard(&self, id: GroupId) -> Option<&ShardStateMachine> {
        self.shards
            .get(&id)
            .and_then(|shard| shard.replicas.first())
            .map(|replica| replica.as_ref())
    }

    pub fn transport(&self, client: &str) -> LocalTransport {
        self.network.transport(client)
    }

    pub fn client(&self, name: &str) -> LockClient<LocalTransport> {
        LockClient::new(self.transport(name), ClientConfig::new(self.master_addrs()))
    }

    /// Expire every session `name` holds, as if the process died.
    pub async fn crash_client(&self, name: &str) -> anyhow::Result<usize> {
        self.network.crash_client(&ServerAddr::from(name)).await
    }

    /// Fail unless every replica in every group holds identical state.
    pub fn check_replicas_converged(&self) -> anyhow::Result<()> {
        let groups = std::iter::once(&self.master_group)
            .chain(self.shards.values().map(|shard| &shard.group));
        for group in groups {
            let snapshots = group.replica_snapshots()?;
            if snapshots.windows(2).any(|pair| pair[0] != pair[1]) {
                anyhow::bail!("replicas of group {} diverged", group.id());
            }
        }
        Ok(())
    }
}

fn as_state_machines<S: StateMachine>(replicas: &[Arc<S>]) -> Vec<Arc<dyn StateMachine>> {
    replicas
        .iter()
        .map(|replica| replica.clone() as Arc<dyn StateMachine>)
        .collect()
}
