//! In-process replica groups.
//!
//! `LocalGroup` stands in for a consensus group: proposals are serialized,
//! stamped with an index and timestamp, applied to every replica in the same
//! order, and only the leader's effects are dispatched once the apply lock is
//! released. `LocalNetwork` is the address registry used to route sessions,
//! singleton requests, and effects between groups.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::future::BoxFuture;

use super::types::{Applied, Effect, ExecMeta, GroupId, ServerAddr, Session, StateMachine, Transport};

/// Per-group tuning.
#[derive(Clone, Copy, Debug)]
pub struct LocalGroupConfig {
    /// Upper bound for one session or singleton request, including effects.
    pub request_timeout: Duration,
}

impl Default for LocalGroupConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

struct LogState {
    last_index: u64,
    leader: usize,
    available: bool,
}

struct SessionEntry {
    client: ServerAddr,
    on_close: Option<Vec<u8>>,
}

/// Address registry shared by all local groups and transports.
pub struct LocalNetwork {
    groups: RwLock<HashMap<ServerAddr, Arc<LocalGroup>>>,
    clock_skew_ms: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: RwLock::new(HashMap::new()),
            clock_skew_ms: AtomicU64::new(0),
        })
    }

    /// Register a replica group reachable at `servers`.
    ///
    /// Replica 0 starts as leader.
    pub fn add_group(
        self: &Arc<Self>,
        id: GroupId,
        servers: Vec<ServerAddr>,
        replicas: Vec<Arc<dyn StateMachine>>,
        cfg: LocalGroupConfig,
    ) -> anyhow::Result<Arc<LocalGroup>> {
        if replicas.is_empty() {
            anyhow::bail!("group {id} needs at least one replica");
        }
        if servers.is_empty() {
            anyhow::bail!("group {id} needs at least one server address");
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(taken) = servers.iter().find(|addr| groups.contains_key(*addr)) {
            anyhow::bail!("address {taken} is already registered");
        }
        let group = Arc::new(LocalGroup {
            id,
            servers: servers.clone(),
            replicas,
            log: Mutex::new(LogState {
                last_index: 0,
                leader: 0,
                available: true,
            }),
            sessions: Mutex::new(BTreeMap::new()),
            next_session: AtomicU64::new(1),
            network: Arc::downgrade(self),
            cfg,
        });
        for addr in servers {
            groups.insert(addr, group.clone());
        }
        tracing::debug!(group = id, replicas = group.replicas.len(), "local group registered");
        Ok(group)
    }

    pub fn transport(self: &Arc<Self>, local_addr: impl Into<ServerAddr>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            local_addr: local_addr.into(),
        }
    }

    /// Shift the proposer clock forward; used to cross time-based windows.
    pub fn advance_clock(&self, by: Duration) {
        let ms = by.as_millis().min(u128::from(u64::MAX)) as u64;
        self.clock_skew_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn now_ms(&self) -> u64 {
        unix_time_ms().saturating_add(self.clock_skew_ms.load(Ordering::Relaxed))
    }

    fn resolve(&self, servers: &[ServerAddr]) -> anyhow::Result<Arc<LocalGroup>> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        servers
            .iter()
            .find_map(|addr| groups.get(addr).cloned())
            .ok_or_else(|| anyhow!("no replica group reachable at {servers:?}"))
    }

    fn distinct_groups(&self) -> Vec<Arc<LocalGroup>> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_id = BTreeMap::new();
        for group in groups.values() {
            by_id.entry(group.id).or_insert_with(|| group.clone());
        }
        by_id.into_values().collect()
    }

    /// Simulate a client process failure: every group it holds a session
    /// with detects the timeout and commits the session's on-close command.
    pub async fn crash_client(&self, client: &ServerAddr) -> anyhow::Result<usize> {
        let mut expired = 0usize;
        for group in self.distinct_groups() {
            expired += group.expire_client_sessions(client).await?;
        }
        tracing::info!(client = %client, expired, "client sessions expired");
        Ok(expired)
    }

    async fn request(&self, servers: &[ServerAddr], payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let group = self.resolve(servers)?;
        let timeout = group.cfg.request_timeout;
        tokio::time::timeout(timeout, group.propose(payload))
            .await
            .map_err(|_| anyhow!("request to group {} timed out after {timeout:?}", group.id))?
    }
}

/// One replica group: ordered apply across replicas plus session bookkeeping.
pub struct LocalGroup {
    id: GroupId,
    servers: Vec<ServerAddr>,
    replicas: Vec<Arc<dyn StateMachine>>,
    log: Mutex<LogState>,
    sessions: Mutex<BTreeMap<u64, SessionEntry>>,
    next_session: AtomicU64,
    network: Weak<LocalNetwork>,
    cfg: LocalGroupConfig,
}

impl LocalGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn servers(&self) -> &[ServerAddr] {
        &self.servers
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Commit `command` and dispatch the leader's effects before replying.
    pub fn propose(self: &Arc<Self>, command: Vec<u8>) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> {
        let group = Arc::clone(self);
        Box::pin(async move {
            let applied = group.commit(&command)?;
            group.dispatch(applied.effects).await;
            Ok(applied.response)
        })
    }

    fn commit(&self, command: &[u8]) -> anyhow::Result<Applied> {
        let now_ms = self
            .network
            .upgrade()
            .map(|network| network.now_ms())
            .unwrap_or_else(unix_time_ms);
        let mut log = lock(&self.log);
        if !log.available {
            anyhow::bail!("group {} has no leader", self.id);
        }
        log.last_index += 1;
        let meta = ExecMeta {
            index: log.last_index,
            unix_ms: now_ms,
        };
        let mut leader_applied = None;
        for (idx, replica) in self.replicas.iter().enumerate() {
            let applied = replica.apply(command, meta);
            if idx == log.leader {
                leader_applied = Some(applied);
            }
        }
        leader_applied.ok_or_else(|| anyhow!("group {} leader index out of range", self.id))
    }

    async fn dispatch(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        let Some(network) = self.network.upgrade() else {
            tracing::warn!(group = self.id, "network gone; dropping post-commit effects");
            return;
        };
        for effect in effects {
            if let Err(err) = network.request(&effect.target, effect.command).await {
                tracing::warn!(
                    group = self.id,
                    target = ?effect.target,
                    error = ?err,
                    "post-commit effect delivery failed"
                );
            }
        }
    }

    /// Toggle leader availability; proposals fail while unavailable.
    pub fn set_available(&self, available: bool) {
        lock(&self.log).available = available;
    }

    pub fn transfer_leadership(&self, replica: usize) -> anyhow::Result<()> {
        if replica >= self.replicas.len() {
            anyhow::bail!("group {} has no replica {replica}", self.id);
        }
        lock(&self.log).leader = replica;
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        lock(&self.log).last_index
    }

    /// Snapshot every replica; identical bytes mean identical state.
    pub fn replica_snapshots(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let _log = lock(&self.log);
        self.replicas
            .iter()
            .enumerate()
            .map(|(idx, replica)| {
                replica
                    .snapshot()
                    .with_context(|| format!("snapshot replica {idx} of group {}", self.id))
            })
            .collect()
    }

    /// Rebuild one replica from the leader's snapshot.
    pub fn resync_replica(&self, replica: usize) -> anyhow::Result<()> {
        let log = lock(&self.log);
        let target = self
            .replicas
            .get(replica)
            .ok_or_else(|| anyhow!("group {} has no replica {replica}", self.id))?;
        let snapshot = self.replicas[log.leader]
            .snapshot()
            .context("snapshot leader")?;
        target.restore(&snapshot).context("restore replica")?;
        Ok(())
    }

    fn open_session(&self, client: ServerAddr, on_close: Option<Vec<u8>>) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        lock(&self.sessions).insert(id, SessionEntry { client, on_close });
        id
    }

    fn session_alive(&self, id: u64) -> bool {
        lock(&self.sessions).contains_key(&id)
    }

    fn end_session(&self, id: u64) -> Option<SessionEntry> {
        lock(&self.sessions).remove(&id)
    }

    async fn expire_client_sessions(self: Arc<Self>, client: &ServerAddr) -> anyhow::Result<usize> {
        let expired = {
            let mut sessions = lock(&self.sessions);
            let ids = sessions
                .iter()
                .filter(|(_, entry)| entry.client == *client)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect::<Vec<_>>()
        };
        let count = expired.len();
        for entry in expired {
            if let Some(command) = entry.on_close {
                self.propose(command)
                    .await
                    .with_context(|| format!("commit on-close command in group {}", self.id))?;
            }
        }
        Ok(count)
    }
}

/// Client endpoint on a `LocalNetwork`.
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local_addr: ServerAddr,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_addr(&self) -> ServerAddr {
        self.local_addr.clone()
    }

    async fn open_session(
        &self,
        servers: &[ServerAddr],
        on_close: Option<Vec<u8>>,
    ) -> anyhow::Result<Box<dyn Session>> {
        let group = self.network.resolve(servers)?;
        let id = group.open_session(self.local_addr.clone(), on_close);
        tracing::debug!(group = group.id, session = id, client = %self.local_addr, "session opened");
        Ok(Box::new(LocalSession {
            group,
            id,
            closed: AtomicBool::new(false),
        }))
    }

    async fn send_singleton(
        &self,
        servers: &[ServerAddr],
        payload: Vec<u8>,
    ) -> anyhow::Result<Vec<u8>> {
        self.network.request(servers, payload).await
    }
}

/// Session bound to one local group.
pub struct LocalSession {
    group: Arc<LocalGroup>,
    id: u64,
    closed: AtomicBool,
}

#[async_trait]
impl Session for LocalSession {
    async fn send(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) || !self.group.session_alive(self.id) {
            anyhow::bail!("session {} with group {} has expired", self.id, self.group.id);
        }
        let timeout = self.group.cfg.request_timeout;
        tokio::time::timeout(timeout, self.group.propose(payload))
            .await
            .map_err(|_| anyhow!("request to group {} timed out after {timeout:?}", self.group.id))?
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(entry) = self.group.end_session(self.id) else {
            // Already expired; the group committed the on-close command then.
            return Ok(());
        };
        if let Some(command) = entry.on_close {
            self.group
                .propose(command)
                .await
                .with_context(|| format!("commit on-close command in group {}", self.group.id))?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends every command to a log; `fwd:<addr>:<cmd>` also emits an effect.
    #[derive(Default)]
    struct Recorder {
        entries: Mutex<Vec<(u64, String)>>,
    }

    impl Recorder {
        fn commands(&self) -> Vec<String> {
            lock(&self.entries).iter().map(|(_, c)| c.clone()).collect()
        }
    }

    impl StateMachine for Recorder {
        fn apply(&self, data: &[u8], meta: ExecMeta) -> Applied {
            let text = String::from_utf8_lossy(data).to_string();
            lock(&self.entries).push((meta.index, text.clone()));
            let mut applied = Applied::reply(format!("ok:{}", meta.index).into_bytes());
            if let Some(rest) = text.strip_prefix("fwd:") {
                if let Some((addr, cmd)) = rest.split_once(':') {
                    applied.effects.push(Effect {
                        target: vec![ServerAddr::from(addr)],
                        command: cmd.as_bytes().to_vec(),
                    });
                }
            }
            applied
        }

        fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
            Ok(serde_json::to_vec(&*lock(&self.entries))?)
        }

        fn restore(&self, snapshot: &[u8]) -> anyhow::Result<()> {
            *lock(&self.entries) = serde_json::from_slice(snapshot)?;
            Ok(())
        }
    }

    fn group_of(
        network: &Arc<LocalNetwork>,
        id: GroupId,
        addr: &str,
        replicas: usize,
    ) -> (Arc<LocalGroup>, Vec<Arc<Recorder>>) {
        let recorders = (0..replicas)
            .map(|_| Arc::new(Recorder::default()))
            .collect::<Vec<_>>();
        let sms = recorders
            .iter()
            .map(|r| r.clone() as Arc<dyn StateMachine>)
            .collect();
        let group = network
            .add_group(id, vec![ServerAddr::from(addr)], sms, LocalGroupConfig::default())
            .expect("add group");
        (group, recorders)
    }

    #[tokio::test]
    async fn every_replica_applies_in_the_same_order() {
        let network = LocalNetwork::new();
        let (group, recorders) = group_of(&network, 1, "g1", 3);
        let transport = network.transport("client");
        for cmd in ["a", "b", "c"] {
            transport
                .send_singleton(group.servers(), cmd.as_bytes().to_vec())
                .await
                .expect("send");
        }
        for recorder in &recorders {
            assert_eq!(recorder.commands(), vec!["a", "b", "c"]);
        }
        assert_eq!(group.replica_count(), 3);
        assert_eq!(group.last_index(), 3);
        let snapshots = group.replica_snapshots().expect("snapshots");
        assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn effects_are_dispatched_once_from_the_leader() {
        let network = LocalNetwork::new();
        let (source, _) = group_of(&network, 1, "src", 3);
        let (_target, target_recorders) = group_of(&network, 2, "dst", 2);
        let transport = network.transport("client");
        transport
            .send_singleton(source.servers(), b"fwd:dst:hello".to_vec())
            .await
            .expect("send");
        assert_eq!(target_recorders[0].commands(), vec!["hello"]);
        assert_eq!(target_recorders[1].commands(), vec!["hello"]);
    }

    #[tokio::test]
    async fn closing_a_session_commits_its_on_close_command() {
        let network = LocalNetwork::new();
        let (group, recorders) = group_of(&network, 1, "g1", 1);
        let transport = network.transport("client");
        let session = transport
            .open_session(group.servers(), Some(b"bye".to_vec()))
            .await
            .expect("open");
        session.send(b"work".to_vec()).await.expect("send");
        session.close().await.expect("close");
        session.close().await.expect("second close is a no-op");
        assert_eq!(recorders[0].commands(), vec!["work", "bye"]);
        let err = session.send(b"late".to_vec()).await.expect_err("closed session");
        assert!(err.to_string().contains("expired"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn crashed_client_sessions_run_on_close() {
        let network = LocalNetwork::new();
        let (group, recorders) = group_of(&network, 1, "g1", 1);
        let transport = network.transport("doomed");
        let other = network.transport("survivor");
        let _s1 = transport
            .open_session(group.servers(), Some(b"release-doomed".to_vec()))
            .await
            .expect("open");
        let _s2 = other
            .open_session(group.servers(), Some(b"release-survivor".to_vec()))
            .await
            .expect("open");
        let expired = network
            .crash_client(&ServerAddr::from("doomed"))
            .await
            .expect("crash");
        assert_eq!(expired, 1);
        assert_eq!(recorders[0].commands(), vec!["release-doomed"]);
    }

    #[tokio::test]
    async fn unavailable_group_rejects_requests() {
        let network = LocalNetwork::new();
        let (group, _) = group_of(&network, 1, "g1", 1);
        group.set_available(false);
        let transport = network.transport("client");
        let err = transport
            .send_singleton(group.servers(), b"x".to_vec())
            .await
            .expect_err("no leader");
        assert!(err.to_string().contains("no leader"), "unexpected error: {err}");
        group.set_available(true);
        transport
            .send_singleton(group.servers(), b"x".to_vec())
            .await
            .expect("leader back");
    }

    #[tokio::test]
    async fn resync_restores_replica_from_leader() {
        let network = LocalNetwork::new();
        let (group, recorders) = group_of(&network, 1, "g1", 2);
        let transport = network.transport("client");
        transport
            .send_singleton(group.servers(), b"one".to_vec())
            .await
            .expect("send");
        recorders[1]
            .restore(b"[]")
            .expect("wipe follower");
        group.resync_replica(1).expect("resync");
        assert_eq!(recorders[1].commands(), vec!["one"]);
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let network = LocalNetwork::new();
        let _ = group_of(&network, 1, "g1", 1);
        let err = network
            .add_group(
                2,
                vec![ServerAddr::from("g1")],
                vec![Arc::new(Recorder::default())],
                LocalGroupConfig::default(),
            )
            .err()
            .expect("collision");
        assert!(err.to_string().contains("already registered"));
    }
}
