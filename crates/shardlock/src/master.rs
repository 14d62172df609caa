//! Master coordinator state machine.
//!
//! The master owns the domain tree and the lock-to-shard assignment and
//! drives migrations. Everything it tells a shard travels as a post-commit
//! [`Effect`], and everything a shard tells it arrives as a committed entry,
//! so the assignment table stays the single arbiter of ownership.
//!
//! Migration of one lock:
//! 1. `TransferRequest` to the source shard (pending, awaiting report).
//! 2. The source answers with `TransferReport`. Ready locks complete right
//!    away: `ClaimLocks` on the destination with the last sequencer as seed,
//!    `DisownLocks` on the source, reassignment. Deferred locks wait.
//! 3. A deferred lock completes the same way on `ReleasedRecalcitrant`.
//!
//! Effects can be lost in delivery. A migration whose last `TransferRequest`
//! is older than `transfer_retry` is asked again on the next frequency report
//! or migrate command, and naming a pending lock in `MigrateLocks` asks again
//! right away. The source answers a repeated request from its current state:
//! a lock disabled by an earlier request or by a recalcitrant release comes
//! back ready.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shardlock_rsm::rsm::{Applied, Effect, ExecMeta, GroupId, ServerAddr, StateMachine};

use crate::command::{decode_command, encode_command, Command, GroupLoad, Response};
use crate::config::{MasterConfig, RebalanceConfig};
use crate::domain::{DomainPath, DomainTree};
use crate::error::LockError;
use crate::load::LoadEstimate;
use crate::rebalance::{plan_rebalance_step, LockLoad, ShardLoad};

/// In-flight move of one lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub from: GroupId,
    pub to: GroupId,
    /// `TransferRequest` sent, `TransferReport` not yet received.
    pub awaiting_report: bool,
    /// Commit time of the latest `TransferRequest`.
    #[serde(default)]
    pub requested_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct MasterState {
    domains: DomainTree,
    groups: BTreeMap<GroupId, Vec<ServerAddr>>,
    assignments: BTreeMap<String, GroupId>,
    /// Count from the latest frequency report that covered the lock.
    lock_counts: BTreeMap<String, u64>,
    loads: BTreeMap<GroupId, LoadEstimate>,
    migrations: BTreeMap<String, PendingMigration>,
    domain_home: BTreeMap<DomainPath, GroupId>,
    last_rebalance_ms: u64,
}

pub struct MasterStateMachine {
    rebalance: RebalanceConfig,
    state: RwLock<MasterState>,
}

impl MasterStateMachine {
    pub fn new(cfg: MasterConfig) -> Self {
        let groups = cfg
            .groups
            .into_iter()
            .map(|group| (group.id, group.servers))
            .collect();
        Self {
            rebalance: cfg.rebalance,
            state: RwLock::new(MasterState {
                groups,
                ..MasterState::default()
            }),
        }
    }

    pub fn assignment(&self, lock: &str) -> Option<GroupId> {
        self.read().assignments.get(lock).copied()
    }

    pub fn pending_migration(&self, lock: &str) -> Option<PendingMigration> {
        self.read().migrations.get(lock).cloned()
    }

    pub fn domain_home(&self, domain: &DomainPath) -> Option<GroupId> {
        self.read().domain_home.get(domain).copied()
    }

    pub fn group_loads(&self) -> Vec<GroupLoad> {
        self.read().group_loads()
    }

    fn read(&self) -> RwLockReadGuard<'_, MasterState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MasterState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&self, cmd: Command, meta: ExecMeta) -> Applied {
        let mut effects = Vec::new();
        let mut state = self.write();
        let result = match cmd {
            Command::CreateDomain { domain } => state.create_domain(&domain).map(|()| Response::ok()),
            Command::CreateLock { lock } => state.create_lock(lock, &mut effects),
            Command::DeleteLock { lock } => state.delete_lock(&lock, &mut effects).map(|()| Response::ok()),
            Command::LocateLock { lock } => state.locate(&lock),
            Command::FrequencyUpdate {
                group,
                locks,
                counts,
            } => {
                state.record_frequencies(group, &locks, &counts, self.rebalance.ewma_alpha);
                state.retry_stale_transfers(self.rebalance.transfer_retry, meta.unix_ms, &mut effects);
                state.maybe_rebalance(&self.rebalance, meta.unix_ms, &mut effects);
                Ok(Response::ok())
            }
            Command::TransferReport {
                group,
                ready,
                sequencers,
                deferred,
                missing,
            } => {
                state.transfer_report(group, &ready, &sequencers, &deferred, &missing, &mut effects);
                Ok(Response::ok())
            }
            Command::ReleasedRecalcitrant {
                lock,
                sequencer,
                group,
            } => {
                state.released_recalcitrant(&lock, sequencer, group, &mut effects);
                Ok(Response::ok())
            }
            Command::MigrateLocks { locks, target } => {
                let started = state.start_migration(&locks, target, meta.unix_ms, &mut effects);
                state.retry_stale_transfers(self.rebalance.transfer_retry, meta.unix_ms, &mut effects);
                started.map(|()| Response::ok())
            }
            Command::GroupLoads => Ok(Response {
                loads: state.group_loads(),
                ..Response::ok()
            }),
            other => Err(LockError::InvalidRequest(format!(
                "{} is not served by the master",
                other.function()
            ))),
        };
        drop(state);
        let response = result.unwrap_or_else(|err| Response::error(&err));
        Applied {
            response: response.encode(),
            effects,
        }
    }
}

impl MasterState {
    fn create_domain(&mut self, domain: &str) -> Result<(), LockError> {
        let path = DomainPath::parse(domain)?;
        self.domains.insert(path)?;
        tracing::info!(domain, "domain created");
        Ok(())
    }

    fn create_lock(&mut self, lock: String, effects: &mut Vec<Effect>) -> Result<Response, LockError> {
        if self.assignments.contains_key(&lock) {
            return Err(LockError::LockExists);
        }
        let domain = self.domains.domain_of(&lock);
        let group = match self.domain_home.get(&domain).copied() {
            Some(home) if !domain.is_root() => home,
            _ => {
                let group = self.least_loaded_group().ok_or_else(|| {
                    LockError::InvalidRequest("no shard groups registered".to_string())
                })?;
                if !domain.is_root() {
                    self.domain_home.insert(domain.clone(), group);
                }
                group
            }
        };
        self.send(
            group,
            Command::ClaimLocks {
                locks: vec![lock.clone()],
                sequencers: Vec::new(),
            },
            effects,
        );
        tracing::info!(lock = %lock, group, domain = %domain, "lock created");
        self.assignments.insert(lock.clone(), group);
        self.lock_counts.insert(lock, 0);
        Ok(Response {
            group: Some(group),
            servers: self.groups.get(&group).cloned().unwrap_or_default(),
            ..Response::ok()
        })
    }

    fn delete_lock(&mut self, lock: &str, effects: &mut Vec<Effect>) -> Result<(), LockError> {
        let group = self.assignments.remove(lock).ok_or(LockError::LockNotFound)?;
        self.lock_counts.remove(lock);
        if self.migrations.remove(lock).is_some() {
            tracing::debug!(lock, "pending migration dropped by delete");
        }
        self.send(
            group,
            Command::DisownLocks {
                locks: vec![lock.to_string()],
            },
            effects,
        );
        tracing::info!(lock, group, "lock deleted");
        Ok(())
    }

    fn locate(&self, lock: &str) -> Result<Response, LockError> {
        let group = *self.assignments.get(lock).ok_or(LockError::LockNotFound)?;
        Ok(Response {
            group: Some(group),
            servers: self.groups.get(&group).cloned().unwrap_or_default(),
            ..Response::ok()
        })
    }

    /// Lowest (load, assigned locks, id).
    fn least_loaded_group(&self) -> Option<GroupId> {
        let counts = self.assigned_counts();
        self.groups
            .keys()
            .map(|group| {
                let load = self.loads.get(group).map(|l| l.value).unwrap_or(0.0);
                let count = counts.get(group).copied().unwrap_or(0);
                (load, count, *group)
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(&b.2))
            })
            .map(|(_, _, group)| group)
    }

    fn assigned_counts(&self) -> BTreeMap<GroupId, usize> {
        let mut counts = BTreeMap::new();
        for group in self.assignments.values() {
            *counts.entry(*group).or_insert(0usize) += 1;
        }
        counts
    }

    fn group_loads(&self) -> Vec<GroupLoad> {
        let counts = self.assigned_counts();
        self.groups
            .keys()
            .map(|group| GroupLoad {
                group: *group,
                load: self.loads.get(group).map(|l| l.value).unwrap_or(0.0),
                locks: counts.get(group).copied().unwrap_or(0),
                pending_migrations: self
                    .migrations
                    .values()
                    .filter(|m| m.from == *group)
                    .count(),
            })
            .collect()
    }

    fn record_frequencies(&mut self, group: GroupId, locks: &[String], counts: &[u64], alpha: f64) {
        if !self.groups.contains_key(&group) {
            tracing::warn!(group, "frequency report from unknown group ignored");
            return;
        }
        let mut total = 0u64;
        for (lock, count) in locks.iter().zip(counts) {
            // Reports can trail a migration; only the current owner's counts stick.
            if self.assignments.get(lock) == Some(&group) {
                total = total.saturating_add(*count);
                self.lock_counts.insert(lock.clone(), *count);
            }
        }
        self.loads.entry(group).or_default().observe(total as f64, alpha);
        tracing::debug!(group, total, "frequency report recorded");
    }

    fn maybe_rebalance(&mut self, cfg: &RebalanceConfig, now_ms: u64, effects: &mut Vec<Effect>) {
        if !cfg.enabled {
            return;
        }
        if self.migrations.values().any(|m| m.awaiting_report) {
            return;
        }
        let cooldown_ms = u64::try_from(cfg.cooldown.as_millis()).unwrap_or(u64::MAX);
        if self.last_rebalance_ms != 0 && now_ms.saturating_sub(self.last_rebalance_ms) < cooldown_ms {
            return;
        }
        let Some(plan) = plan_rebalance_step(&self.load_view(), cfg) else {
            return;
        };
        let moved = plan
            .locks
            .iter()
            .map(|lock| self.lock_counts.get(lock).copied().unwrap_or(0) as f64)
            .sum::<f64>();
        tracing::info!(
            from = plan.from,
            to = plan.to,
            locks = plan.locks.len(),
            domain = ?plan.domain.as_ref().map(ToString::to_string),
            "rebalance planned"
        );
        if let Err(err) = self.start_migration(&plan.locks, plan.to, now_ms, effects) {
            tracing::warn!(error = %err, "rebalance plan rejected");
            return;
        }
        if let Some(domain) = plan.domain {
            self.domain_home.insert(domain, plan.to);
        }
        self.loads.entry(plan.from).or_default().shift(-moved);
        self.loads.entry(plan.to).or_default().shift(moved);
        self.last_rebalance_ms = now_ms;
    }

    fn load_view(&self) -> Vec<ShardLoad> {
        let mut view = self
            .groups
            .keys()
            .map(|group| {
                (
                    *group,
                    ShardLoad {
                        group: *group,
                        load: self.loads.get(group).map(|l| l.value).unwrap_or(0.0),
                        locks: Vec::new(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        for (lock, group) in &self.assignments {
            if self.migrations.contains_key(lock) {
                continue;
            }
            if let Some(shard) = view.get_mut(group) {
                shard.locks.push(LockLoad {
                    lock: lock.clone(),
                    domain: self.domains.domain_of(lock),
                    count: self.lock_counts.get(lock).copied().unwrap_or(0),
                });
            }
        }
        view.into_values().collect()
    }

    /// Record pending migrations and ask each source shard to hand the locks
    /// over. Locks already on `target` are skipped. A lock that is already
    /// moving keeps its destination and has its source asked again.
    fn start_migration(
        &mut self,
        locks: &[String],
        target: GroupId,
        now_ms: u64,
        effects: &mut Vec<Effect>,
    ) -> Result<(), LockError> {
        if !self.groups.contains_key(&target) {
            return Err(LockError::InvalidRequest(format!("unknown group {target}")));
        }
        let mut fresh: BTreeMap<GroupId, Vec<String>> = BTreeMap::new();
        let mut repeat = Vec::new();
        for lock in locks {
            let from = *self.assignments.get(lock).ok_or(LockError::LockNotFound)?;
            if self.migrations.contains_key(lock) {
                repeat.push(lock.clone());
            } else if from != target {
                fresh.entry(from).or_default().push(lock.clone());
            }
        }
        for (from, locks) in fresh {
            for lock in &locks {
                self.migrations.insert(
                    lock.clone(),
                    PendingMigration {
                        from,
                        to: target,
                        awaiting_report: true,
                        requested_ms: now_ms,
                    },
                );
            }
            tracing::info!(from, to = target, count = locks.len(), "transfer requested");
            self.send(from, Command::TransferRequest { locks }, effects);
        }
        self.request_transfers(&repeat, now_ms, effects);
        Ok(())
    }

    /// Ask again for every migration whose last request is at least `retry`
    /// old, whether its report or its recalcitrant release went missing.
    fn retry_stale_transfers(&mut self, retry: Duration, now_ms: u64, effects: &mut Vec<Effect>) {
        let retry_ms = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX);
        let stale = self
            .migrations
            .iter()
            .filter(|(_, m)| now_ms.saturating_sub(m.requested_ms) >= retry_ms)
            .map(|(lock, _)| lock.clone())
            .collect::<Vec<_>>();
        self.request_transfers(&stale, now_ms, effects);
    }

    /// Re-send `TransferRequest` for pending migrations, grouped by source.
    fn request_transfers(&mut self, locks: &[String], now_ms: u64, effects: &mut Vec<Effect>) {
        let mut by_source: BTreeMap<GroupId, Vec<String>> = BTreeMap::new();
        for lock in locks {
            let Some(migration) = self.migrations.get_mut(lock) else {
                continue;
            };
            migration.awaiting_report = true;
            migration.requested_ms = now_ms;
            by_source.entry(migration.from).or_default().push(lock.clone());
        }
        for (from, locks) in by_source {
            tracing::info!(from, count = locks.len(), "transfer requested again");
            self.send(from, Command::TransferRequest { locks }, effects);
        }
    }

    fn transfer_report(
        &mut self,
        group: GroupId,
        ready: &[String],
        sequencers: &[u64],
        deferred: &[String],
        missing: &[String],
        effects: &mut Vec<Effect>,
    ) {
        for lock in deferred {
            if let Some(migration) = self.migrations.get_mut(lock) {
                if migration.from == group {
                    migration.awaiting_report = false;
                }
            }
        }
        for lock in missing {
            if self.migrations.get(lock).is_some_and(|m| m.from == group) {
                tracing::warn!(lock = %lock, group, "lock missing on source; migration dropped");
                self.migrations.remove(lock);
            }
        }
        let completed = ready
            .iter()
            .zip(sequencers)
            .filter(|(lock, _)| self.migrations.get(*lock).is_some_and(|m| m.from == group))
            .map(|(lock, seq)| (lock.clone(), *seq))
            .collect::<Vec<_>>();
        self.complete_migrations(completed, effects);
    }

    fn released_recalcitrant(
        &mut self,
        lock: &str,
        sequencer: u64,
        group: GroupId,
        effects: &mut Vec<Effect>,
    ) {
        if !self.migrations.get(lock).is_some_and(|m| m.from == group) {
            tracing::debug!(lock, group, "released notification without pending migration");
            return;
        }
        self.complete_migrations(vec![(lock.to_string(), sequencer)], effects);
    }

    /// Claim on the destination, disown on the source, reassign.
    fn complete_migrations(&mut self, locks: Vec<(String, u64)>, effects: &mut Vec<Effect>) {
        let mut moves: BTreeMap<(GroupId, GroupId), (Vec<String>, Vec<u64>)> = BTreeMap::new();
        for (lock, sequencer) in locks {
            let Some(migration) = self.migrations.remove(&lock) else {
                continue;
            };
            self.assignments.insert(lock.clone(), migration.to);
            let slot = moves.entry((migration.from, migration.to)).or_default();
            slot.0.push(lock);
            slot.1.push(sequencer);
        }
        for ((from, to), (locks, sequencers)) in moves {
            tracing::info!(from, to, count = locks.len(), "migration completed");
            self.send(
                to,
                Command::ClaimLocks {
                    locks: locks.clone(),
                    sequencers,
                },
                effects,
            );
            self.send(from, Command::DisownLocks { locks }, effects);
        }
    }

    fn send(&self, group: GroupId, cmd: Command, effects: &mut Vec<Effect>) {
        let Some(servers) = self.groups.get(&group) else {
            tracing::warn!(group, function = cmd.function(), "no addresses for group; command dropped");
            return;
        };
        match encode_command(&cmd) {
            Ok(command) => effects.push(Effect {
                target: servers.clone(),
                command,
            }),
            Err(err) => tracing::warn!(error = ?err, group, "shard command encode failed"),
        }
    }
}

impl StateMachine for MasterStateMachine {
    fn apply(&self, data: &[u8], meta: ExecMeta) -> Applied {
        match decode_command(data) {
            Ok(cmd) => {
                tracing::debug!(index = meta.index, function = cmd.function(), "master apply");
                self.execute(cmd, meta)
            }
            Err(err) => {
                tracing::warn!(error = %err, "master command decode failed");
                Applied::reply(Response::error(&err).encode())
            }
        }
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let state = self.read();
        serde_json::to_vec(&*state).context("encode master snapshot")
    }

    fn restore(&self, snapshot: &[u8]) -> anyhow::Result<()> {
        let restored: MasterState =
            serde_json::from_slice(snapshot).context("decode master snapshot")?;
        *self.write() = restored;
        Ok(())
    }
}
