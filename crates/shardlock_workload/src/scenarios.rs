//! Fixed correctness scenarios run in order against one cluster.
//!
//! Scenarios share the cluster and the two long-lived clients, so later ones
//! see the locks earlier ones created (e.g. `duplicate_create` relies on
//! `simple`).

use anyhow::Context;
use shardlock::cluster::LocalCluster;
use shardlock::{ClientError, LockClient, LockError};
use shardlock_rsm::rsm::LocalTransport;

type Client = LockClient<LocalTransport>;

/// Outcome of one scenario.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub passed: bool,
    pub error: Option<String>,
}

struct Ctx<'a> {
    cluster: &'a LocalCluster,
    first: Client,
    second: Client,
}

/// Run every scenario and return one result per scenario.
pub async fn run_all(cluster: &LocalCluster) -> Vec<ScenarioResult> {
    let mut ctx = Ctx {
        cluster,
        first: cluster.client("scenario-client-1"),
        second: cluster.client("scenario-client-2"),
    };
    let mut results = Vec::new();
    macro_rules! scenario {
        ($name:literal, $f:ident) => {{
            let outcome = $f(&mut ctx).await;
            match &outcome {
                Ok(()) => tracing::info!(scenario = $name, "passed"),
                Err(err) => tracing::error!(scenario = $name, error = %format!("{err:#}"), "failed"),
            }
            results.push(ScenarioResult {
                name: $name,
                passed: outcome.is_ok(),
                error: outcome.err().map(|err| format!("{err:#}")),
            });
        }};
    }
    scenario!("validate_lock", validate_lock);
    scenario!("recalcitrant_locks", recalcitrant_locks);
    scenario!("basic_rebalancing", basic_rebalancing);
    scenario!("rebalancing_domains", rebalancing_domains);
    scenario!("simple", simple);
    scenario!("double_acquire", double_acquire);
    scenario!("release_unacquired", release_unacquired);
    scenario!("duplicate_create", duplicate_create);
    scenario!("create_domain", create_domain);
    scenario!("nonexistent_lock", nonexistent_lock);
    scenario!("delete", delete);
    scenario!("join", join);
    scenario!("race_domain", race_domain);
    scenario!("multiple_acquire", multiple_acquire);
    scenario!("release_by_other_client", release_by_other_client);
    scenario!("destroy_releases", destroy_releases);
    scenario!("crash_releases", crash_releases);
    results
}

/// Fail unless `result` is the lock error `want`.
fn expect_lock_err<T: std::fmt::Debug>(
    result: Result<T, ClientError>,
    want: LockError,
) -> anyhow::Result<()> {
    match result {
        Err(ClientError::Lock(err)) if err == want => Ok(()),
        Err(err) => anyhow::bail!("expected {want}, got error {err}"),
        Ok(value) => anyhow::bail!("expected {want}, got success {value:?}"),
    }
}

async fn validate_lock(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_lock("validate_lock").await?;
    let seq = ctx.first.acquire_lock("validate_lock").await?;
    anyhow::ensure!(ctx.first.validate_lock("validate_lock", seq).await?, "own token rejected");
    anyhow::ensure!(
        !ctx.first.validate_lock("validate_lock", seq - 1).await?,
        "older token accepted"
    );
    Ok(())
}

async fn recalcitrant_locks(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    let locks = (0..4).map(|i| format!("recal_lock{i}")).collect::<Vec<_>>();
    for lock in &locks {
        ctx.first.create_lock(lock).await?;
        ctx.first.acquire_lock(lock).await?;
    }
    // Move every held lock somewhere else; each finishes on release.
    for lock in &locks {
        let home = ctx.first.cached_group(lock).context("lock location not cached")?;
        let target = ctx
            .cluster
            .shard_ids()
            .into_iter()
            .find(|id| *id != home)
            .unwrap_or(home);
        ctx.first.migrate_locks(std::slice::from_ref(lock), target).await?;
    }
    for lock in &locks {
        ctx.first.release_lock(lock).await?;
    }
    for lock in &locks {
        let seq = ctx.first.acquire_lock(lock).await?;
        anyhow::ensure!(seq == 2, "{lock}: expected sequencer 2 after move, got {seq}");
        anyhow::ensure!(
            ctx.cluster.master().pending_migration(lock).is_none(),
            "{lock}: migration still pending"
        );
    }
    Ok(())
}

async fn basic_rebalancing(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    for i in 0..5 {
        ctx.first.create_lock(&format!("simple_lock{i}")).await?;
    }
    Ok(())
}

async fn rebalancing_domains(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_domain("/a").await?;
    ctx.first.create_domain("/b").await?;
    let locks = ["/a/lock0", "/a/lock1", "/b/lock2", "/b/lock3"];
    for lock in locks {
        ctx.first.create_lock(lock).await?;
    }
    for lock in locks {
        ctx.first.acquire_lock(lock).await?;
    }
    Ok(())
}

async fn simple(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_lock("simple_lock").await?;
    ctx.first.acquire_lock("simple_lock").await?;
    ctx.first.release_lock("simple_lock").await?;
    Ok(())
}

async fn double_acquire(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_lock("double_acquire_lock").await?;
    let first = ctx.first.acquire_lock("double_acquire_lock").await?;
    let second = ctx.first.acquire_lock("double_acquire_lock").await?;
    anyhow::ensure!(first == second, "re-acquire changed sequencer {first} -> {second}");
    Ok(())
}

async fn release_unacquired(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_lock("unacquired_lock").await?;
    expect_lock_err(ctx.first.release_lock("unacquired_lock").await, LockError::LockNotHeld)
}

async fn duplicate_create(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    expect_lock_err(ctx.first.create_lock("simple_lock").await, LockError::LockExists)
}

async fn create_domain(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_domain("/first").await?;
    expect_lock_err(ctx.first.create_domain("/first").await, LockError::DomainExists)?;
    ctx.first.create_domain("/first/second").await?;
    expect_lock_err(
        ctx.first.create_domain("/first/third/hi").await,
        LockError::ParentDomainMissing,
    )?;
    expect_lock_err(ctx.first.create_domain("/").await, LockError::InvalidDomain)
}

async fn nonexistent_lock(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    expect_lock_err(ctx.first.acquire_lock("doesnotexist").await, LockError::LockNotFound)
}

async fn delete(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    let lock = "delete_lock";
    ctx.first.create_lock(lock).await?;
    ctx.first.delete_lock(lock).await?;
    anyhow::ensure!(ctx.first.acquire_lock(lock).await.is_err(), "acquired after delete");

    // Deleted while held: gone once released.
    ctx.first.create_lock(lock).await?;
    ctx.first.acquire_lock(lock).await?;
    ctx.first.delete_lock(lock).await?;
    ctx.first.release_lock(lock).await?;
    anyhow::ensure!(ctx.first.acquire_lock(lock).await.is_err(), "acquired after delete");
    Ok(())
}

async fn join(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_domain("/join").await?;
    for i in 1..=8 {
        ctx.first.create_lock(&format!("/join/{i}")).await?;
    }
    let home = ctx.cluster.master().assignment("/join/1");
    for i in 2..=8 {
        let lock = format!("/join/{i}");
        anyhow::ensure!(
            ctx.cluster.master().assignment(&lock) == home,
            "{lock} placed away from its domain"
        );
    }
    for i in 1..=8 {
        ctx.first.delete_lock(&format!("/join/{i}")).await?;
    }
    Ok(())
}

async fn race_domain(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_domain("/firsty").await?;
    expect_lock_err(ctx.second.create_domain("/firsty").await, LockError::DomainExists)
}

async fn multiple_acquire(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_lock("race_lock").await?;
    ctx.first.acquire_lock("race_lock").await?;
    expect_lock_err(ctx.second.acquire_lock("race_lock").await, LockError::LockHeld)
}

async fn release_by_other_client(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    ctx.first.create_lock("race_2_lock").await?;
    ctx.first.acquire_lock("race_2_lock").await?;
    expect_lock_err(ctx.second.release_lock("race_2_lock").await, LockError::WrongHolder)
}

async fn destroy_releases(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    let mut client = ctx.cluster.client("scenario-client-3");
    client.create_lock("client_fail_lock").await?;
    client.acquire_lock("client_fail_lock").await?;
    client.destroy().await?;

    let mut next = ctx.cluster.client("scenario-client-3");
    next.acquire_lock("client_fail_lock").await?;
    next.destroy().await?;
    Ok(())
}

async fn crash_releases(ctx: &mut Ctx<'_>) -> anyhow::Result<()> {
    let mut doomed = ctx.cluster.client("scenario-client-doomed");
    doomed.create_lock("crash_lock").await?;
    doomed.acquire_lock("crash_lock").await?;
    expect_lock_err(ctx.second.acquire_lock("crash_lock").await, LockError::LockHeld)?;

    ctx.cluster.crash_client("scenario-client-doomed").await?;
    ctx.second.acquire_lock("crash_lock").await?;
    ctx.second.release_lock("crash_lock").await?;
    Ok(())
}
