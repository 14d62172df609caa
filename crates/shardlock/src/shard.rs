//! Shard state machine.
//!
//! A shard owns the authoritative state of the locks assigned to its replica
//! group. Every mutation arrives as a committed entry through
//! [`StateMachine::apply`]; the `RwLock` only keeps snapshots from observing
//! a half-applied entry. Notifications to the master (frequency reports,
//! transfer reports, recalcitrant releases) leave as [`Effect`] values and
//! are sent by the substrate after commit.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shardlock_rsm::rsm::{Applied, Effect, ExecMeta, GroupId, ServerAddr, StateMachine};

use crate::command::{decode_command, encode_command, Command, Response};
use crate::config::ShardConfig;
use crate::error::LockError;
use crate::load::FrequencyWindow;

/// Per-lock state on the owning shard.
///
/// `recalcitrant` and `pending_delete` only appear on held locks; `disabled`
/// only on unheld ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub held: bool,
    pub holder: Option<ServerAddr>,
    /// Migration requested while held; finishes on release.
    pub recalcitrant: bool,
    /// Unacquirable: handed off to the master for migration.
    pub disabled: bool,
    /// Deleted while held; the entry goes away on release.
    pub pending_delete: bool,
    pub freq_count: u64,
    pub saved_freq_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ShardState {
    locks: BTreeMap<String, LockState>,
    /// Survives disown so a lock that returns to this shard keeps counting up.
    sequencers: BTreeMap<String, u64>,
    /// Where notifications go; replicated so a restored replica reports to
    /// the same master as the rest of its group.
    master: Vec<ServerAddr>,
    window: FrequencyWindow,
}

pub struct ShardStateMachine {
    cfg: ShardConfig,
    state: RwLock<ShardState>,
}

/// Effects accumulated while applying one entry.
struct Outbox {
    group: GroupId,
    master: Vec<ServerAddr>,
    effects: Vec<Effect>,
}

impl Outbox {
    fn to_master(&mut self, cmd: Command) {
        if self.master.is_empty() {
            return;
        }
        match encode_command(&cmd) {
            Ok(command) => self.effects.push(Effect {
                target: self.master.clone(),
                command,
            }),
            Err(err) => {
                tracing::warn!(error = ?err, function = cmd.function(), "dropping master notification")
            }
        }
    }
}

impl ShardStateMachine {
    pub fn new(cfg: ShardConfig) -> Self {
        let state = ShardState {
            master: cfg.master.clone(),
            ..ShardState::default()
        };
        Self {
            cfg,
            state: RwLock::new(state),
        }
    }

    pub fn group(&self) -> GroupId {
        self.cfg.group
    }

    pub fn lock_state(&self, lock: &str) -> Option<LockState> {
        self.read().locks.get(lock).cloned()
    }

    pub fn sequencer(&self, lock: &str) -> Option<u64> {
        self.read().sequencers.get(lock).copied()
    }

    pub fn owned_locks(&self) -> Vec<String> {
        self.read().locks.keys().cloned().collect()
    }

    pub fn master(&self) -> Vec<ServerAddr> {
        self.read().master.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, ShardState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ShardState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&self, cmd: Command, meta: ExecMeta) -> Applied {
        let period_ms = duration_ms(self.cfg.frequency_period);
        let mut state = self.write();
        let mut out = Outbox {
            group: self.cfg.group,
            master: state.master.clone(),
            effects: Vec::new(),
        };
        let response = match cmd {
            Command::AcquireLock { lock, client } => {
                state.count_op(&lock, meta.unix_ms, period_ms, &mut out);
                match state.acquire(&lock, client) {
                    Ok(sequencer) => Response::sequencer(sequencer),
                    Err(err) => Response::acquire_failed(&err),
                }
            }
            Command::ReleaseLock { lock, client } => {
                state.count_op(&lock, meta.unix_ms, period_ms, &mut out);
                match state.release(&lock, &client, &mut out) {
                    Ok(()) => Response::ok(),
                    Err(err) => Response::error(&err),
                }
            }
            Command::ValidateLock { lock, sequencer } => {
                state.count_op(&lock, meta.unix_ms, period_ms, &mut out);
                match state.validate(&lock, sequencer) {
                    Ok(valid) => Response {
                        valid: Some(valid),
                        ..Response::ok()
                    },
                    Err(err) => Response {
                        valid: Some(false),
                        ..Response::error(&err)
                    },
                }
            }
            Command::ClaimLocks { locks, sequencers } => {
                state.claim(&locks, &sequencers);
                tracing::info!(group = self.cfg.group, count = locks.len(), "claimed locks");
                Response::ok()
            }
            Command::DisownLocks { locks } => {
                state.disown(&locks);
                tracing::info!(group = self.cfg.group, count = locks.len(), "disowned locks");
                Response::ok()
            }
            Command::TransferRequest { locks } => {
                let report = state.transfer(&locks);
                tracing::info!(
                    group = self.cfg.group,
                    ready = report.ready.len(),
                    deferred = report.deferred.len(),
                    missing = report.missing.len(),
                    "transfer requested"
                );
                out.to_master(Command::TransferReport {
                    group: self.cfg.group,
                    ready: report.ready.clone(),
                    sequencers: report.sequencers,
                    deferred: report.deferred.clone(),
                    missing: report.missing.clone(),
                });
                Response {
                    ready: report.ready,
                    deferred: report.deferred,
                    missing: report.missing,
                    ..Response::ok()
                }
            }
            Command::ReleaseForClient { client } => {
                let released = state.release_for_client(&client, &mut out);
                tracing::info!(group = self.cfg.group, client = %client, released, "released locks for client");
                Response::ok()
            }
            other => Response::error(&LockError::InvalidRequest(format!(
                "{} is not served by a shard",
                other.function()
            ))),
        };
        drop(state);
        Applied {
            response: response.encode(),
            effects: out.effects,
        }
    }
}

struct TransferOutcome {
    ready: Vec<String>,
    sequencers: Vec<u64>,
    deferred: Vec<String>,
    missing: Vec<String>,
}

impl ShardState {
    fn acquire(&mut self, lock: &str, client: ServerAddr) -> Result<u64, LockError> {
        let entry = self.locks.get_mut(lock).ok_or(LockError::LockNotFound)?;
        if entry.pending_delete {
            return Err(LockError::LockNotFound);
        }
        let sequencer = self.sequencers.entry(lock.to_string()).or_insert(0);
        if entry.held {
            if entry.holder.as_ref() == Some(&client) {
                return Ok(*sequencer);
            }
            return Err(LockError::LockHeld);
        }
        if entry.disabled {
            return Err(LockError::LockHeld);
        }
        entry.held = true;
        entry.holder = Some(client);
        *sequencer += 1;
        Ok(*sequencer)
    }

    fn release(&mut self, lock: &str, client: &ServerAddr, out: &mut Outbox) -> Result<(), LockError> {
        let entry = self.locks.get(lock).ok_or(LockError::LockNotFound)?;
        if !entry.held {
            return Err(LockError::LockNotHeld);
        }
        if entry.holder.as_ref() != Some(client) {
            return Err(LockError::WrongHolder);
        }
        self.clear_holder(lock, out);
        Ok(())
    }

    /// Drop the holder of a held lock and run the follow-up transitions.
    fn clear_holder(&mut self, lock: &str, out: &mut Outbox) {
        let Some(entry) = self.locks.get_mut(lock) else {
            return;
        };
        entry.held = false;
        entry.holder = None;
        if entry.pending_delete {
            self.locks.remove(lock);
            tracing::debug!(lock, "deleted lock released");
            return;
        }
        if entry.recalcitrant {
            entry.recalcitrant = false;
            entry.disabled = true;
            let sequencer = self.sequencers.get(lock).copied().unwrap_or(0);
            out.to_master(Command::ReleasedRecalcitrant {
                lock: lock.to_string(),
                sequencer,
                group: out.group,
            });
        }
    }

    fn validate(&self, lock: &str, sequencer: u64) -> Result<bool, LockError> {
        if !self.locks.contains_key(lock) {
            return Err(LockError::LockNotFound);
        }
        Ok(self.sequencers.get(lock).copied().unwrap_or(0) == sequencer)
    }

    /// Take ownership of `locks`. A held entry keeps its holder, so a
    /// redelivered claim is harmless; a held entry left over from a delete
    /// becomes the new lock instead of vanishing on release. Anything else
    /// starts fresh.
    fn claim(&mut self, locks: &[String], seeds: &[u64]) {
        for (idx, lock) in locks.iter().enumerate() {
            let seed = seeds.get(idx).copied().unwrap_or(0);
            let sequencer = self.sequencers.entry(lock.clone()).or_insert(0);
            *sequencer = (*sequencer).max(seed);
            let entry = self.locks.entry(lock.clone()).or_default();
            if !entry.held {
                *entry = LockState::default();
            } else if entry.pending_delete {
                entry.pending_delete = false;
                entry.recalcitrant = false;
            }
        }
    }

    fn disown(&mut self, locks: &[String]) {
        for lock in locks {
            match self.locks.get_mut(lock) {
                Some(entry) if entry.held => entry.pending_delete = true,
                Some(_) => {
                    self.locks.remove(lock);
                }
                None => {}
            }
        }
    }

    fn transfer(&mut self, locks: &[String]) -> TransferOutcome {
        let mut outcome = TransferOutcome {
            ready: Vec::new(),
            sequencers: Vec::new(),
            deferred: Vec::new(),
            missing: Vec::new(),
        };
        for lock in locks {
            let Some(entry) = self.locks.get_mut(lock) else {
                outcome.missing.push(lock.clone());
                continue;
            };
            if entry.held {
                entry.recalcitrant = true;
                outcome.deferred.push(lock.clone());
            } else {
                entry.disabled = true;
                outcome.ready.push(lock.clone());
                outcome
                    .sequencers
                    .push(self.sequencers.get(lock).copied().unwrap_or(0));
            }
        }
        outcome
    }

    fn release_for_client(&mut self, client: &ServerAddr, out: &mut Outbox) -> usize {
        let held = self
            .locks
            .iter()
            .filter(|(_, entry)| entry.held && entry.holder.as_ref() == Some(client))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for lock in &held {
            self.clear_holder(lock, out);
        }
        held.len()
    }

    /// Count one operation on `lock`, rolling the window first.
    fn count_op(&mut self, lock: &str, now_ms: u64, period_ms: u64, out: &mut Outbox) {
        if !self.locks.contains_key(lock) {
            return;
        }
        if self.window.roll(now_ms, period_ms) {
            let mut locks = Vec::with_capacity(self.locks.len());
            let mut counts = Vec::with_capacity(self.locks.len());
            for (name, entry) in self.locks.iter_mut() {
                entry.saved_freq_count = entry.freq_count;
                entry.freq_count = 0;
                locks.push(name.clone());
                counts.push(entry.saved_freq_count);
            }
            tracing::debug!(group = out.group, locks = locks.len(), "frequency window rolled");
            out.to_master(Command::FrequencyUpdate {
                group: out.group,
                locks,
                counts,
            });
        }
        if let Some(entry) = self.locks.get_mut(lock) {
            entry.freq_count = entry.freq_count.saturating_add(1);
        }
    }
}

impl StateMachine for ShardStateMachine {
    fn apply(&self, data: &[u8], meta: ExecMeta) -> Applied {
        match decode_command(data) {
            Ok(cmd) => {
                tracing::debug!(group = self.cfg.group, index = meta.index, function = cmd.function(), "shard apply");
                self.execute(cmd, meta)
            }
            Err(err) => {
                tracing::warn!(group = self.cfg.group, error = %err, "shard command decode failed");
                Applied::reply(Response::error(&err).encode())
            }
        }
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let state = self.read();
        serde_json::to_vec(&*state).context("encode shard snapshot")
    }

    fn restore(&self, snapshot: &[u8]) -> anyhow::Result<()> {
        let restored: ShardState =
            serde_json::from_slice(snapshot).context("decode shard snapshot")?;
        *self.write() = restored;
        Ok(())
    }
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
