//! Rebalance planning.
//!
//! Pure functions over a load view; the master applies the resulting plan
//! inside its own committed entry. One plan moves work from the hottest
//! shard to the coldest one and never more than half the gap between them,
//! so a plan cannot flip the imbalance the other way.

use std::collections::BTreeMap;

use shardlock_rsm::rsm::GroupId;

use crate::config::RebalanceConfig;
use crate::domain::DomainPath;

/// Last reported activity of one lock.
#[derive(Clone, Debug, PartialEq)]
pub struct LockLoad {
    pub lock: String,
    pub domain: DomainPath,
    pub count: u64,
}

/// Load view of one shard.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardLoad {
    pub group: GroupId,
    pub load: f64,
    pub locks: Vec<LockLoad>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MigrationPlan {
    pub from: GroupId,
    pub to: GroupId,
    pub locks: Vec<String>,
    /// Set when the plan moves every lock of one domain; the domain is
    /// re-homed on `to`.
    pub domain: Option<DomainPath>,
}

pub fn plan_rebalance_step(shards: &[ShardLoad], cfg: &RebalanceConfig) -> Option<MigrationPlan> {
    if !cfg.enabled || shards.len() < 2 {
        return None;
    }
    let hot = shards.iter().fold(None::<&ShardLoad>, |best, shard| match best {
        Some(best) if best.load >= shard.load => Some(best),
        _ => Some(shard),
    })?;
    let cold = shards
        .iter()
        .filter(|shard| shard.group != hot.group)
        .fold(None::<&ShardLoad>, |best, shard| match best {
            Some(best) if best.load <= shard.load => Some(best),
            _ => Some(shard),
        })?;
    let gap = hot.load - cold.load;
    if gap < cfg.imbalance_threshold {
        return None;
    }
    let budget = gap / 2.0;

    if let Some((domain, locks)) = plan_domain_move(hot, budget) {
        return Some(MigrationPlan {
            from: hot.group,
            to: cold.group,
            locks,
            domain: Some(domain),
        });
    }

    let locks = plan_lock_move(hot, budget, cfg.max_locks_per_move);
    if locks.is_empty() {
        return None;
    }
    Some(MigrationPlan {
        from: hot.group,
        to: cold.group,
        locks,
        domain: None,
    })
}

/// Busiest non-root domain on `hot` whose total load fits in `budget`.
fn plan_domain_move(hot: &ShardLoad, budget: f64) -> Option<(DomainPath, Vec<String>)> {
    let mut by_domain: BTreeMap<&DomainPath, (u64, Vec<String>)> = BTreeMap::new();
    for lock in hot.locks.iter().filter(|lock| !lock.domain.is_root()) {
        let slot = by_domain.entry(&lock.domain).or_default();
        slot.0 = slot.0.saturating_add(lock.count);
        slot.1.push(lock.lock.clone());
    }
    // Never empty the hot shard through one domain move.
    let total_locks = hot.locks.len();
    by_domain
        .into_iter()
        .filter(|(_, (count, locks))| {
            *count > 0 && (*count as f64) <= budget && locks.len() < total_locks
        })
        .max_by(|(da, (ca, _)), (db, (cb, _))| ca.cmp(cb).then_with(|| db.cmp(da)))
        .map(|(domain, (_, locks))| (domain.clone(), locks))
}

/// Hottest individual locks whose combined load fits in `budget`.
fn plan_lock_move(hot: &ShardLoad, budget: f64, max_locks: usize) -> Vec<String> {
    let mut candidates = hot
        .locks
        .iter()
        .filter(|lock| lock.count > 0)
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.lock.cmp(&b.lock)));
    let mut moved = 0.0;
    let mut picked = Vec::new();
    for lock in candidates {
        if picked.len() >= max_locks.max(1) {
            break;
        }
        let next = moved + lock.count as f64;
        if next > budget {
            continue;
        }
        moved = next;
        picked.push(lock.lock.clone());
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(name: &str, domain: &str, count: u64) -> LockLoad {
        LockLoad {
            lock: name.to_string(),
            domain: DomainPath::parse(domain).expect("domain"),
            count,
        }
    }

    fn shard(group: GroupId, load: f64, locks: Vec<LockLoad>) -> ShardLoad {
        ShardLoad { group, load, locks }
    }

    fn cfg() -> RebalanceConfig {
        RebalanceConfig {
            imbalance_threshold: 20.0,
            max_locks_per_move: 2,
            ..RebalanceConfig::default()
        }
    }

    #[test]
    fn balanced_cluster_is_left_alone() {
        let shards = vec![
            shard(1, 40.0, vec![lock("a", "/", 40)]),
            shard(2, 30.0, vec![lock("b", "/", 30)]),
        ];
        assert_eq!(plan_rebalance_step(&shards, &cfg()), None);
    }

    #[test]
    fn prefers_a_whole_domain_that_fits() {
        let shards = vec![
            shard(
                1,
                100.0,
                vec![
                    lock("/d/x", "/d", 20),
                    lock("/d/y", "/d", 15),
                    lock("/e/z", "/e", 60),
                    lock("root", "/", 5),
                ],
            ),
            shard(2, 0.0, vec![]),
            shard(3, 10.0, vec![]),
        ];
        let plan = plan_rebalance_step(&shards, &cfg()).expect("plan");
        assert_eq!(plan.from, 1);
        assert_eq!(plan.to, 2);
        assert_eq!(plan.domain, Some(DomainPath::parse("/d").expect("domain")));
        assert_eq!(plan.locks, vec!["/d/x", "/d/y"]);
    }

    #[test]
    fn falls_back_to_hottest_locks_within_budget() {
        let shards = vec![
            shard(
                1,
                100.0,
                vec![
                    lock("a", "/", 70),
                    lock("b", "/", 30),
                    lock("c", "/", 10),
                    lock("d", "/", 5),
                ],
            ),
            shard(2, 0.0, vec![]),
        ];
        let plan = plan_rebalance_step(&shards, &cfg()).expect("plan");
        assert_eq!(plan.domain, None);
        assert_eq!(plan.locks, vec!["b", "c"], "a exceeds the budget, cap is two");
    }

    #[test]
    fn single_oversized_lock_is_not_moved() {
        let shards = vec![
            shard(1, 100.0, vec![lock("a", "/", 100)]),
            shard(2, 0.0, vec![]),
        ];
        assert_eq!(plan_rebalance_step(&shards, &cfg()), None);
    }

    #[test]
    fn disabled_or_single_shard_never_plans() {
        let hot = vec![
            shard(1, 100.0, vec![lock("a", "/", 10)]),
            shard(2, 0.0, vec![]),
        ];
        let off = RebalanceConfig {
            enabled: false,
            ..cfg()
        };
        assert_eq!(plan_rebalance_step(&hot, &off), None);
        assert_eq!(plan_rebalance_step(&hot[..1], &cfg()), None);
    }
}
