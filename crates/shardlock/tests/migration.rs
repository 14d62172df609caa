//! Lock migration between shards, forced by an operator and driven by load.

mod common;

use std::time::Duration;

use common::{cluster, lock_err, rebalancing_cluster};
use shardlock::domain::DomainPath;
use shardlock::LockError;

#[tokio::test]
async fn held_lock_moves_after_release() {
    let cluster = cluster(2);
    let mut holder = cluster.client("client-1");
    let mut other = cluster.client("client-2");
    holder.create_lock("m").await.expect("create");
    let source = holder.cached_group("m").expect("cached");
    let target = if source == 1 { 2 } else { 1 };
    assert_eq!(holder.acquire_lock("m").await.expect("acquire"), 1);

    holder
        .migrate_locks(&["m".to_string()], target)
        .await
        .expect("migrate");
    let pending = cluster.master().pending_migration("m").expect("pending");
    assert!(!pending.awaiting_report, "source already reported");
    assert_eq!(cluster.master().assignment("m"), Some(source));
    assert!(cluster.shard(source).expect("source").lock_state("m").expect("lock").recalcitrant);

    // The holder keeps the lock until it lets go.
    assert_eq!(
        lock_err(other.acquire_lock("m").await.expect_err("held")),
        LockError::LockHeld
    );
    assert!(holder.validate_lock("m", 1).await.expect("validate"));

    holder.release_lock("m").await.expect("release");
    assert_eq!(cluster.master().assignment("m"), Some(target));
    assert!(cluster.master().pending_migration("m").is_none());
    assert!(cluster.shard(source).expect("source").lock_state("m").is_none());
    assert_eq!(cluster.shard(target).expect("target").sequencer("m"), Some(1));

    assert_eq!(other.acquire_lock("m").await.expect("acquire on target"), 2);
    // Stale cache on the holder side: the old shard no longer knows the lock.
    assert!(holder.validate_lock("m", 2).await.expect("validate after move"));
    assert_eq!(holder.cached_group("m"), Some(target));
    cluster.check_replicas_converged().expect("replicas agree");
}

#[tokio::test]
async fn transfer_lost_to_an_unavailable_source_is_requested_again() {
    let cluster = cluster(2);
    let mut client = cluster.client("client-1");
    client.create_lock("m").await.expect("create");
    let source = client.cached_group("m").expect("cached");
    let target = if source == 1 { 2 } else { 1 };
    let source_group = cluster.shard_group(source).expect("source group");

    source_group.set_available(false);
    client
        .migrate_locks(&["m".to_string()], target)
        .await
        .expect("migrate");
    assert!(cluster.master().pending_migration("m").expect("pending").awaiting_report);
    source_group.set_available(true);

    client
        .migrate_locks(&["m".to_string()], target)
        .await
        .expect("migrate again");
    assert_eq!(cluster.master().assignment("m"), Some(target));
    assert!(cluster.master().pending_migration("m").is_none());
    assert_eq!(client.acquire_lock("m").await.expect("acquire"), 1);
    assert_eq!(client.cached_group("m"), Some(target));
    cluster.check_replicas_converged().expect("replicas agree");
}

#[tokio::test]
async fn lost_recalcitrant_release_does_not_strand_the_lock() {
    let cluster = cluster(2);
    let mut holder = cluster.client("client-1");
    let mut other = cluster.client("client-2");
    holder.create_lock("m").await.expect("create");
    let source = holder.cached_group("m").expect("cached");
    let target = if source == 1 { 2 } else { 1 };
    assert_eq!(holder.acquire_lock("m").await.expect("acquire"), 1);
    holder
        .migrate_locks(&["m".to_string()], target)
        .await
        .expect("migrate");

    // The release notification cannot reach the master.
    cluster.master_group().set_available(false);
    holder.release_lock("m").await.expect("release");
    cluster.master_group().set_available(true);
    assert!(cluster.shard(source).expect("source").lock_state("m").expect("lock").disabled);
    assert_eq!(
        lock_err(other.acquire_lock("m").await.expect_err("disabled")),
        LockError::LockHeld
    );

    holder
        .migrate_locks(&["m".to_string()], target)
        .await
        .expect("migrate again");
    assert_eq!(cluster.master().assignment("m"), Some(target));
    assert!(cluster.shard(source).expect("source").lock_state("m").is_none());
    assert_eq!(other.acquire_lock("m").await.expect("acquire on target"), 2);
    cluster.check_replicas_converged().expect("replicas agree");
}

#[tokio::test]
async fn free_lock_moves_immediately() {
    let cluster = cluster(2);
    let mut client = cluster.client("client-1");
    client.create_lock("free").await.expect("create");
    for _ in 0..3 {
        client.acquire_lock("free").await.expect("acquire");
        client.release_lock("free").await.expect("release");
    }
    let source = client.cached_group("free").expect("cached");
    let target = if source == 1 { 2 } else { 1 };

    client
        .migrate_locks(&["free".to_string()], target)
        .await
        .expect("migrate");
    assert_eq!(cluster.master().assignment("free"), Some(target));
    assert!(cluster.master().pending_migration("free").is_none());

    // Cached location still points at the source; the client relocates.
    assert_eq!(client.cached_group("free"), Some(source));
    assert_eq!(client.acquire_lock("free").await.expect("acquire"), 4);
    assert_eq!(client.cached_group("free"), Some(target));
}

#[tokio::test]
async fn migrating_to_the_current_owner_is_a_no_op() {
    let cluster = cluster(2);
    let mut client = cluster.client("client-1");
    client.create_lock("stay").await.expect("create");
    let home = client.cached_group("stay").expect("cached");
    client
        .migrate_locks(&["stay".to_string()], home)
        .await
        .expect("migrate");
    assert!(cluster.master().pending_migration("stay").is_none());
    assert_eq!(cluster.master().assignment("stay"), Some(home));

    assert_eq!(
        lock_err(
            client
                .migrate_locks(&["missing".to_string()], home)
                .await
                .expect_err("unknown lock")
        ),
        LockError::LockNotFound
    );
}

#[tokio::test]
async fn load_reports_move_a_cool_domain_off_a_hot_shard() {
    let period = Duration::from_secs(60);
    let cluster = rebalancing_cluster(2, period);
    let mut client = cluster.client("client-1");
    client.create_domain("/hot").await.expect("domain");
    client.create_domain("/warm").await.expect("domain");

    // /hot homes on 1, the root lock goes to 2, and /warm ties back onto 1.
    client.create_lock("/hot/a").await.expect("create");
    client.create_lock("r").await.expect("create");
    client.create_lock("/warm/b").await.expect("create");
    assert_eq!(cluster.master().assignment("/hot/a"), Some(1));
    assert_eq!(cluster.master().assignment("r"), Some(2));
    assert_eq!(cluster.master().assignment("/warm/b"), Some(1));

    for _ in 0..5 {
        client.acquire_lock("/hot/a").await.expect("acquire");
        client.release_lock("/hot/a").await.expect("release");
    }
    for _ in 0..2 {
        client.acquire_lock("/warm/b").await.expect("acquire");
        client.release_lock("/warm/b").await.expect("release");
    }

    // The next counted operation closes the window and reports 10 + 4.
    cluster.network().advance_clock(period * 2);
    assert!(client.validate_lock("/hot/a", 5).await.expect("validate"));

    let warm = DomainPath::parse("/warm").expect("domain");
    assert_eq!(cluster.master().assignment("/warm/b"), Some(2));
    assert_eq!(cluster.master().assignment("/hot/a"), Some(1));
    assert_eq!(cluster.master().domain_home(&warm), Some(2));
    assert!(cluster.shard(1).expect("shard 1").lock_state("/warm/b").is_none());

    // Sequencers carry over, and new locks in the domain follow its home.
    assert!(client.validate_lock("/warm/b", 2).await.expect("validate"));
    assert_eq!(client.acquire_lock("/warm/b").await.expect("acquire"), 3);
    client.create_lock("/warm/c").await.expect("create");
    assert_eq!(cluster.master().assignment("/warm/c"), Some(2));

    let loads = client.group_loads().await.expect("loads");
    assert!(loads.iter().all(|load| load.pending_migrations == 0), "{loads:?}");
    cluster.check_replicas_converged().expect("replicas agree");
}
