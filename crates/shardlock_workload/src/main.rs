//! Workload generator for exercising the sharded lock service in process.
//!
//! `run` starts a local cluster, lets many clients contend on a set of locks
//! spread over domains, records the operation history as JSON, and checks it
//! for mutual exclusion and sequencer ordering. `scenarios` runs the fixed
//! correctness scenarios.

mod history;
mod scenarios;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use shardlock::cluster::{LocalCluster, LocalClusterConfig};
use shardlock::{ClientError, LockError, RebalanceConfig};
use shardlock_rsm::rsm::LocalGroupConfig;
use tokio::time;

use crate::history::{
    check_history, read_history, write_history, History, HistoryMeta, OpKind, OpRecord, OpResult,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "shardlock-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
    Scenarios(ClusterArgs),
    Check(CheckArgs),
}

/// CLI options for re-checking a recorded history.
#[derive(Parser, Debug, Clone)]
struct CheckArgs {
    #[arg(long, default_value = ".tmp/shardlock/history.json")]
    history: PathBuf,
}

/// Shape of the in-process cluster.
#[derive(Parser, Debug, Clone)]
struct ClusterArgs {
    /// Number of shard groups.
    #[arg(long, default_value_t = 3)]
    shards: usize,

    /// Replicas per group (master included).
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// Shard frequency reporting period.
    #[arg(long, default_value = "200ms")]
    frequency_period: humantime::Duration,

    /// Let the master move locks when shard load drifts apart.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    rebalance: bool,

    /// Load gap (ops per period) that triggers a rebalance.
    #[arg(long, default_value_t = 20.0)]
    imbalance_threshold: f64,

    /// Upper bound for one request, including the effects it triggers.
    #[arg(long, default_value = "10s")]
    request_timeout: humantime::Duration,
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Number of concurrent clients.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Number of contended locks.
    #[arg(long, default_value_t = 16)]
    locks: usize,

    /// Number of domains the locks are spread over (the rest live in the root).
    #[arg(long, default_value_t = 2)]
    domains: usize,

    /// Total runtime for the workload.
    #[arg(long, default_value = "5s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Percent of successful acquires followed by a validate.
    #[arg(long, default_value_t = 50)]
    validate_pct: u8,

    /// Percent of successful acquires after which the client crashes instead
    /// of releasing.
    #[arg(long, default_value_t = 0)]
    crash_pct: u8,

    /// Per-operation timeout.
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,

    /// When true, any unexpected operation error aborts the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Write the JSON history to this path.
    #[arg(long, default_value = ".tmp/shardlock/history.json")]
    out: PathBuf,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::Scenarios(args) => run_scenarios(args).await,
        Command::Check(args) => check(args),
    }
}

/// Re-run the history checks over a file written by `run`.
fn check(args: CheckArgs) -> anyhow::Result<()> {
    let history = read_history(&args.history)?;
    report_violations(&history)
}

fn report_violations(history: &History) -> anyhow::Result<()> {
    let violations = check_history(history);
    for violation in &violations {
        tracing::error!(%violation, "history violation");
    }
    anyhow::ensure!(
        violations.is_empty(),
        "{} violations in {} operations (seed {})",
        violations.len(),
        history.ops.len(),
        history.meta.seed
    );
    tracing::info!(ops = history.ops.len(), seed = history.meta.seed, "history is clean");
    Ok(())
}

fn start_cluster(args: &ClusterArgs) -> anyhow::Result<LocalCluster> {
    anyhow::ensure!(args.shards > 0, "--shards must be > 0");
    anyhow::ensure!(args.replicas > 0, "--replicas must be > 0");
    let period: Duration = args.frequency_period.into();
    LocalCluster::start(LocalClusterConfig {
        shards: args.shards,
        replicas: args.replicas,
        frequency_period: period,
        rebalance: RebalanceConfig {
            enabled: args.rebalance,
            imbalance_threshold: args.imbalance_threshold,
            cooldown: period,
            ..RebalanceConfig::default()
        },
        group: LocalGroupConfig {
            request_timeout: args.request_timeout.into(),
        },
    })
}

async fn run_scenarios(args: ClusterArgs) -> anyhow::Result<()> {
    let cluster = start_cluster(&args)?;
    let results = scenarios::run_all(&cluster).await;
    let failed = results.iter().filter(|r| !r.passed).count();
    cluster
        .check_replicas_converged()
        .context("replica state after scenarios")?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    anyhow::ensure!(failed == 0, "{failed} of {} scenarios failed", results.len());
    Ok(())
}

/// Lock names: every `domains + 1`-th lock lives in the root, the others are
/// spread over `/d0 .. /d{domains-1}`.
fn lock_names(locks: usize, domains: usize) -> Vec<String> {
    (0..locks)
        .map(|i| match i % (domains + 1) {
            0 => format!("lock{i}"),
            d => format!("/d{}/lock{i}", d - 1),
        })
        .collect()
}

/// Run the workload, write the history, and fail on any violation.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.locks > 0, "--locks must be > 0");
    anyhow::ensure!(args.validate_pct <= 100, "--validate-pct must be <= 100");
    anyhow::ensure!(args.crash_pct <= 100, "--crash-pct must be <= 100");

    let cluster = Arc::new(start_cluster(&args.cluster)?);
    let locks = lock_names(args.locks, args.domains);
    let mut admin = cluster.client("workload-admin");
    for d in 0..args.domains {
        admin.create_domain(&format!("/d{d}")).await?;
    }
    for lock in &locks {
        admin.create_lock(lock).await?;
    }
    admin.destroy().await?;

    let duration: Duration = args.duration.into();
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let start = time::Instant::now();
    let deadline = start + duration;

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let worker = Worker {
            cluster: cluster.clone(),
            client_id,
            locks: locks.clone(),
            validate_pct: args.validate_pct,
            crash_pct: args.crash_pct,
            op_timeout: args.op_timeout.into(),
            fail_fast: args.fail_fast,
            // Mix the base seed with the client id for deterministic per-client RNG.
            seed: seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15),
            start,
            deadline,
        };
        tasks.push(tokio::spawn(worker.run()));
    }

    let mut all_ops = Vec::new();
    for task in tasks {
        let mut ops = task.await.context("client task panicked")??;
        all_ops.append(&mut ops);
    }
    all_ops.sort_by_key(|op| (op.call_us, op.return_us));

    let loads = cluster.master().group_loads();
    for load in &loads {
        tracing::info!(
            group = load.group,
            locks = load.locks,
            load = load.load,
            pending = load.pending_migrations,
            "final shard load"
        );
    }
    cluster
        .check_replicas_converged()
        .context("replica state after workload")?;

    let history = History {
        meta: HistoryMeta {
            shards: args.cluster.shards,
            replicas: args.cluster.replicas,
            clients: args.clients,
            locks,
            duration_ms: duration.as_millis() as u64,
            seed,
            validate_pct: args.validate_pct,
            crash_pct: args.crash_pct,
            rebalance: args.cluster.rebalance,
        },
        ops: all_ops,
    };
    write_history(&args.out, &history).context("write history")?;
    eprintln!("wrote history: {}", args.out.display());

    report_violations(&history)
}

/// One contending client; comes back under a new name after a crash.
struct Worker {
    cluster: Arc<LocalCluster>,
    client_id: usize,
    locks: Vec<String>,
    validate_pct: u8,
    crash_pct: u8,
    op_timeout: Duration,
    fail_fast: bool,
    seed: u64,
    start: time::Instant,
    deadline: time::Instant,
}

impl Worker {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    async fn run(self) -> anyhow::Result<Vec<OpRecord>> {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut ops = Vec::new();
        let mut incarnation = 0usize;
        let mut name = format!("client-{}-{incarnation}", self.client_id);
        let mut client = self.cluster.client(&name);

        while time::Instant::now() < self.deadline {
            let lock = self.locks[rng.gen_range(0..self.locks.len())].clone();

            let call_us = self.now_us();
            let acquired = time::timeout(self.op_timeout, client.acquire_lock(&lock)).await;
            let (result, err) = self.outcome(acquired, |seq| OpResult::Granted { sequencer: seq });
            let granted = match &result {
                OpResult::Granted { sequencer } => Some(*sequencer),
                _ => None,
            };
            ops.push(self.record(&name, OpKind::Acquire, Some(&lock), None, call_us, result));
            let Some(seq) = granted else {
                self.check(&name, &ops, err)?;
                tokio::task::yield_now().await;
                continue;
            };

            if rng.gen_range(0..100) < u32::from(self.validate_pct) {
                let call_us = self.now_us();
                let validated =
                    time::timeout(self.op_timeout, client.validate_lock(&lock, seq)).await;
                let (result, err) = self.outcome(validated, |valid| OpResult::Valid { valid });
                ops.push(self.record(&name, OpKind::Validate, Some(&lock), Some(seq), call_us, result));
                self.check(&name, &ops, err)?;
            }

            if rng.gen_range(0..100) < u32::from(self.crash_pct) {
                let call_us = self.now_us();
                let crashed = time::timeout(self.op_timeout, self.cluster.crash_client(&name)).await;
                let result = match crashed {
                    Ok(Ok(_)) => OpResult::Ok,
                    Ok(Err(err)) => OpResult::Err {
                        error: format!("{err:#}"),
                    },
                    Err(_) => OpResult::Err {
                        error: "timed out".to_string(),
                    },
                };
                let failed = matches!(result, OpResult::Err { .. });
                ops.push(self.record(&name, OpKind::Crash, None, None, call_us, result));
                if failed && self.fail_fast {
                    anyhow::bail!("{name} crash injection failed");
                }
                incarnation += 1;
                name = format!("client-{}-{incarnation}", self.client_id);
                client = self.cluster.client(&name);
                continue;
            }

            let call_us = self.now_us();
            let released = time::timeout(self.op_timeout, client.release_lock(&lock)).await;
            let (result, err) = self.outcome(released, |()| OpResult::Ok);
            ops.push(self.record(&name, OpKind::Release, Some(&lock), None, call_us, result));
            self.check(&name, &ops, err)?;
        }

        if let Err(err) = client.destroy().await {
            tracing::warn!(client = %name, error = %err, "destroy failed");
        }
        Ok(ops)
    }

    /// Map a timed client call to a history result, plus the error text when
    /// the failure is not an expected contention outcome. A held lock and a
    /// lock caught mid-move (`CannotLocateLock`) are expected.
    fn outcome<T>(
        &self,
        reply: Result<Result<T, ClientError>, time::error::Elapsed>,
        ok: impl FnOnce(T) -> OpResult,
    ) -> (OpResult, Option<String>) {
        match reply {
            Ok(Ok(value)) => (ok(value), None),
            Ok(Err(ClientError::Lock(err))) => {
                let unexpected = !matches!(err, LockError::LockHeld | LockError::CannotLocateLock);
                let text = err.to_wire();
                (
                    OpResult::Err { error: text.clone() },
                    unexpected.then_some(text),
                )
            }
            Ok(Err(err)) => {
                let text = format!("{err:#}");
                (OpResult::Err { error: text.clone() }, Some(text))
            }
            Err(_) => {
                let text = "timed out".to_string();
                (OpResult::Err { error: text.clone() }, Some(text))
            }
        }
    }

    fn record(
        &self,
        client: &str,
        op: OpKind,
        lock: Option<&str>,
        sequencer: Option<u64>,
        call_us: u64,
        result: OpResult,
    ) -> OpRecord {
        OpRecord {
            client: client.to_string(),
            op,
            lock: lock.map(str::to_string),
            sequencer,
            call_us,
            return_us: self.now_us(),
            result,
        }
    }

    fn check(&self, name: &str, ops: &[OpRecord], err: Option<String>) -> anyhow::Result<()> {
        let Some(err) = err else {
            return Ok(());
        };
        tracing::warn!(client = %name, ops = ops.len(), error = %err, "operation failed");
        if self.fail_fast {
            anyhow::bail!("{name} operation failed: {err}");
        }
        Ok(())
    }
}
