//! Operation history recorded by the workload and the checks run over it.
//!
//! A client definitely holds a lock from the moment its acquire returned
//! until the moment it called release (or crashed). Two clients' definite
//! hold intervals on the same lock must never overlap, and sequencers must
//! grow with real time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;

/// Metadata embedded in the history file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryMeta {
    pub shards: usize,
    pub replicas: usize,
    pub clients: usize,
    pub locks: Vec<String>,
    pub duration_ms: u64,
    pub seed: u64,
    pub validate_pct: u8,
    pub crash_pct: u8,
    pub rebalance: bool,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct History {
    pub meta: HistoryMeta,
    pub ops: Vec<OpRecord>,
}

/// Single operation record captured during the workload run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct OpRecord {
    /// Client incarnation; a crashed client comes back under a new name.
    pub client: String,
    pub op: OpKind,
    pub lock: Option<String>,
    /// Token passed to validate.
    pub sequencer: Option<u64>,
    pub call_us: u64,
    pub return_us: u64,
    pub result: OpResult,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Acquire,
    Release,
    Validate,
    Crash,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpResult {
    Ok,
    Granted { sequencer: u64 },
    Valid { valid: bool },
    Err { error: String },
}

/// One broken guarantee found in a history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub lock: String,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.lock, self.detail)
    }
}

#[derive(Debug, Clone)]
struct Hold {
    client: String,
    sequencer: u64,
    start_us: u64,
    end_us: u64,
}

#[derive(Debug, Clone)]
struct Grant {
    client: String,
    sequencer: u64,
    call_us: u64,
    return_us: u64,
}

/// Run every check over `history`; an empty result means the run was clean.
pub fn check_history(history: &History) -> Vec<Violation> {
    let mut ops = history.ops.iter().collect::<Vec<_>>();
    ops.sort_by_key(|op| (op.call_us, op.return_us));

    let mut holds: BTreeMap<String, Vec<Hold>> = BTreeMap::new();
    let mut grants: BTreeMap<String, Vec<Grant>> = BTreeMap::new();
    // (client, lock) -> index into holds[lock] of the open hold.
    let mut open: BTreeMap<(String, String), usize> = BTreeMap::new();

    for op in &ops {
        match (op.op, &op.result, op.lock.as_ref()) {
            (OpKind::Acquire, OpResult::Granted { sequencer }, Some(lock)) => {
                grants.entry(lock.clone()).or_default().push(Grant {
                    client: op.client.clone(),
                    sequencer: *sequencer,
                    call_us: op.call_us,
                    return_us: op.return_us,
                });
                let key = (op.client.clone(), lock.clone());
                if open.contains_key(&key) {
                    continue;
                }
                let list = holds.entry(lock.clone()).or_default();
                list.push(Hold {
                    client: op.client.clone(),
                    sequencer: *sequencer,
                    start_us: op.return_us,
                    end_us: u64::MAX,
                });
                open.insert(key, list.len() - 1);
            }
            (OpKind::Release, OpResult::Ok, Some(lock)) => {
                if let Some(idx) = open.remove(&(op.client.clone(), lock.clone())) {
                    if let Some(hold) = holds.get_mut(lock).and_then(|list| list.get_mut(idx)) {
                        hold.end_us = op.call_us;
                    }
                }
            }
            (OpKind::Crash, _, _) => {
                let keys = open
                    .keys()
                    .filter(|(client, _)| *client == op.client)
                    .cloned()
                    .collect::<Vec<_>>();
                for key in keys {
                    if let Some(idx) = open.remove(&key) {
                        if let Some(hold) = holds.get_mut(&key.1).and_then(|list| list.get_mut(idx)) {
                            hold.end_us = op.call_us;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut violations = Vec::new();
    for (lock, list) in &grants {
        check_grants(lock, list, &mut violations);
    }
    for (lock, list) in &holds {
        check_exclusion(lock, list, &mut violations);
    }
    for op in ops.iter().filter(|op| op.op == OpKind::Validate) {
        check_validate(op, &holds, &mut violations);
    }
    violations
}

/// Each sequencer goes to one client, and a grant that starts after another
/// finished never carries a smaller sequencer.
fn check_grants(lock: &str, grants: &[Grant], out: &mut Vec<Violation>) {
    let mut owners: BTreeMap<u64, &str> = BTreeMap::new();
    for grant in grants {
        match owners.get(&grant.sequencer) {
            Some(owner) if *owner != grant.client => out.push(Violation {
                lock: lock.to_string(),
                detail: format!(
                    "sequencer {} granted to both {owner} and {}",
                    grant.sequencer, grant.client
                ),
            }),
            Some(_) => {}
            None => {
                owners.insert(grant.sequencer, &grant.client);
            }
        }
    }

    let mut by_return = grants.iter().collect::<Vec<_>>();
    by_return.sort_by_key(|g| g.return_us);
    let mut by_call = grants.iter().collect::<Vec<_>>();
    by_call.sort_by_key(|g| g.call_us);
    let mut finished = 0usize;
    let mut highest = 0u64;
    for grant in by_call {
        while finished < by_return.len() && by_return[finished].return_us < grant.call_us {
            highest = highest.max(by_return[finished].sequencer);
            finished += 1;
        }
        if grant.sequencer < highest {
            out.push(Violation {
                lock: lock.to_string(),
                detail: format!(
                    "{} got sequencer {} after {highest} was already granted",
                    grant.client, grant.sequencer
                ),
            });
        }
    }
}

fn check_exclusion(lock: &str, holds: &[Hold], out: &mut Vec<Violation>) {
    let mut sorted = holds.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|h| h.start_us);
    let mut widest: Option<&Hold> = None;
    for hold in sorted {
        if let Some(prev) = widest {
            if hold.start_us < prev.end_us && prev.client != hold.client {
                out.push(Violation {
                    lock: lock.to_string(),
                    detail: format!(
                        "{} (seq {}) and {} (seq {}) held it at the same time",
                        prev.client, prev.sequencer, hold.client, hold.sequencer
                    ),
                });
            }
        }
        if widest.map_or(true, |prev| hold.end_us > prev.end_us) {
            widest = Some(hold);
        }
    }
}

/// A holder's own token is valid for the whole hold, and a token is stale
/// once a newer grant has returned.
fn check_validate(op: &OpRecord, holds: &BTreeMap<String, Vec<Hold>>, out: &mut Vec<Violation>) {
    let (Some(lock), Some(token), OpResult::Valid { valid }) = (&op.lock, op.sequencer, &op.result) else {
        return;
    };
    let Some(list) = holds.get(lock) else {
        return;
    };
    if *valid {
        if let Some(newer) = list
            .iter()
            .find(|h| h.sequencer > token && h.start_us < op.call_us)
        {
            out.push(Violation {
                lock: lock.clone(),
                detail: format!(
                    "token {token} accepted after {} got sequencer {}",
                    newer.client, newer.sequencer
                ),
            });
        }
    } else if list.iter().any(|h| {
        h.client == op.client
            && h.sequencer == token
            && h.start_us <= op.call_us
            && op.return_us <= h.end_us
    }) {
        out.push(Violation {
            lock: lock.clone(),
            detail: format!("{} holds token {token} but it was rejected", op.client),
        });
    }
}

/// Serialize and write the history JSON.
pub fn write_history(path: &Path, history: &History) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(history).context("serialize history")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn read_history(path: &Path) -> anyhow::Result<History> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).context("parse history")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> HistoryMeta {
        HistoryMeta {
            shards: 2,
            replicas: 3,
            clients: 2,
            locks: vec!["L".into()],
            duration_ms: 1_000,
            seed: 7,
            validate_pct: 50,
            crash_pct: 0,
            rebalance: false,
        }
    }

    fn op(client: &str, kind: OpKind, call_us: u64, return_us: u64, result: OpResult) -> OpRecord {
        OpRecord {
            client: client.to_string(),
            op: kind,
            lock: (kind != OpKind::Crash).then(|| "L".to_string()),
            sequencer: None,
            call_us,
            return_us,
            result,
        }
    }

    fn granted(client: &str, seq: u64, call_us: u64, return_us: u64) -> OpRecord {
        op(client, OpKind::Acquire, call_us, return_us, OpResult::Granted { sequencer: seq })
    }

    fn released(client: &str, call_us: u64, return_us: u64) -> OpRecord {
        op(client, OpKind::Release, call_us, return_us, OpResult::Ok)
    }

    fn validated(client: &str, token: u64, call_us: u64, return_us: u64, valid: bool) -> OpRecord {
        OpRecord {
            sequencer: Some(token),
            ..op(client, OpKind::Validate, call_us, return_us, OpResult::Valid { valid })
        }
    }

    fn history(ops: Vec<OpRecord>) -> History {
        History { meta: meta(), ops }
    }

    #[test]
    fn sequential_handoff_is_clean() {
        let h = history(vec![
            granted("a", 1, 0, 10),
            validated("a", 1, 12, 14, true),
            released("a", 20, 25),
            op("b", OpKind::Acquire, 21, 23, OpResult::Err { error: "LockHeld".into() }),
            granted("b", 2, 30, 40),
            validated("a", 1, 45, 50, false),
            released("b", 60, 70),
        ]);
        assert_eq!(check_history(&h), vec![]);
    }

    #[test]
    fn overlapping_holds_are_reported() {
        let h = history(vec![
            granted("a", 1, 0, 10),
            granted("b", 2, 12, 15),
            released("a", 20, 25),
            released("b", 30, 35),
        ]);
        let violations = check_history(&h);
        assert_eq!(violations.len(), 1, "{violations:?}");
        assert!(violations[0].detail.contains("same time"));
    }

    #[test]
    fn crash_ends_the_hold() {
        let h = history(vec![
            granted("a", 1, 0, 10),
            op("a", OpKind::Crash, 20, 30, OpResult::Ok),
            granted("b", 2, 25, 40),
        ]);
        assert_eq!(check_history(&h), vec![]);
    }

    #[test]
    fn sequencer_regressions_are_reported() {
        let h = history(vec![
            granted("a", 5, 0, 10),
            released("a", 11, 12),
            granted("b", 3, 20, 30),
            released("b", 31, 32),
        ]);
        let violations = check_history(&h);
        assert_eq!(violations.len(), 1, "{violations:?}");
        assert!(violations[0].detail.contains("after 5"));
    }

    #[test]
    fn duplicate_sequencer_for_two_clients_is_reported() {
        let h = history(vec![
            granted("a", 1, 0, 10),
            released("a", 11, 12),
            granted("b", 1, 20, 30),
        ]);
        let violations = check_history(&h);
        assert!(
            violations.iter().any(|v| v.detail.contains("granted to both")),
            "{violations:?}"
        );
    }

    #[test]
    fn token_checks_follow_the_holds() {
        let rejected_holder = history(vec![
            granted("a", 1, 0, 10),
            validated("a", 1, 12, 14, false),
        ]);
        assert_eq!(check_history(&rejected_holder).len(), 1);

        let stale_accepted = history(vec![
            granted("a", 1, 0, 10),
            released("a", 11, 12),
            granted("b", 2, 13, 20),
            validated("a", 1, 25, 30, true),
        ]);
        let violations = check_history(&stale_accepted);
        assert_eq!(violations.len(), 1, "{violations:?}");
        assert!(violations[0].detail.contains("accepted"));
    }

    #[test]
    fn history_file_survives_a_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("history.json");
        let h = history(vec![granted("a", 1, 0, 10), released("a", 11, 12)]);
        write_history(&path, &h).expect("write");
        assert_eq!(read_history(&path).expect("read"), h);
    }
}
