//! Lock client.
//!
//! Hides shard topology from callers: create/delete/locate go to the master
//! as singleton requests; acquire/release/validate go straight to the owning
//! shard over a lazily opened session. Locations are cached, and a
//! `LockNotFound` from a shard (the lock moved) triggers one re-locate and
//! retry.
//!
//! Every shard session is opened with a `ReleaseForClient` on-close command,
//! so closing it (explicitly via [`LockClient::destroy`] or through session
//! expiry after a crash) frees whatever this client still holds there.

use std::collections::HashMap;

use anyhow::Context;
use shardlock_rsm::rsm::{GroupId, ServerAddr, Session, Transport};

use crate::command::{encode_command, Command, GroupLoad, Response};
use crate::config::ClientConfig;
use crate::error::{ClientError, LockError};

pub struct LockClient<T: Transport> {
    transport: T,
    cfg: ClientConfig,
    lock_groups: HashMap<String, GroupId>,
    group_servers: HashMap<GroupId, Vec<ServerAddr>>,
    sessions: HashMap<GroupId, Box<dyn Session>>,
}

impl<T: Transport> LockClient<T> {
    pub fn new(transport: T, cfg: ClientConfig) -> Self {
        Self {
            transport,
            cfg,
            lock_groups: HashMap::new(),
            group_servers: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Holder identity used by shards.
    pub fn client_addr(&self) -> ServerAddr {
        self.transport.local_addr()
    }

    pub async fn create_lock(&mut self, lock: &str) -> Result<(), ClientError> {
        let resp = self
            .master_request(&Command::CreateLock {
                lock: lock.to_string(),
            })
            .await?;
        self.remember(lock, &resp);
        Ok(())
    }

    pub async fn create_domain(&mut self, domain: &str) -> Result<(), ClientError> {
        self.master_request(&Command::CreateDomain {
            domain: domain.to_string(),
        })
        .await?;
        Ok(())
    }

    /// The cached location is kept so a holder can still release a lock it
    /// deleted; the shard drops the lock on that release.
    pub async fn delete_lock(&mut self, lock: &str) -> Result<(), ClientError> {
        self.master_request(&Command::DeleteLock {
            lock: lock.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Ask the master where `lock` lives and refresh the cache.
    pub async fn locate_lock(&mut self, lock: &str) -> Result<GroupId, ClientError> {
        let resp = self
            .master_request(&Command::LocateLock {
                lock: lock.to_string(),
            })
            .await?;
        self.remember(lock, &resp)
            .ok_or_else(|| anyhow::anyhow!("locate reply for {lock} carried no group").into())
    }

    /// Forget the cached location of `lock`.
    pub fn invalidate(&mut self, lock: &str) {
        self.lock_groups.remove(lock);
    }

    pub fn cached_group(&self, lock: &str) -> Option<GroupId> {
        self.lock_groups.get(lock).copied()
    }

    /// Returns the fencing sequencer on success.
    pub async fn acquire_lock(&mut self, lock: &str) -> Result<u64, ClientError> {
        let cmd = Command::AcquireLock {
            lock: lock.to_string(),
            client: self.client_addr(),
        };
        let resp = self.shard_request(lock, &cmd).await?;
        resp.sequencer
            .and_then(|seq| u64::try_from(seq).ok())
            .ok_or_else(|| anyhow::anyhow!("acquire reply for {lock} carried no sequencer").into())
    }

    pub async fn release_lock(&mut self, lock: &str) -> Result<(), ClientError> {
        let cmd = Command::ReleaseLock {
            lock: lock.to_string(),
            client: self.client_addr(),
        };
        self.shard_request(lock, &cmd).await?;
        Ok(())
    }

    pub async fn validate_lock(&mut self, lock: &str, sequencer: u64) -> Result<bool, ClientError> {
        let cmd = Command::ValidateLock {
            lock: lock.to_string(),
            sequencer,
        };
        let resp = self.shard_request(lock, &cmd).await?;
        Ok(resp.valid.unwrap_or(false))
    }

    /// Operator request: move `locks` to shard `target`.
    pub async fn migrate_locks(&mut self, locks: &[String], target: GroupId) -> Result<(), ClientError> {
        self.master_request(&Command::MigrateLocks {
            locks: locks.to_vec(),
            target,
        })
        .await?;
        Ok(())
    }

    pub async fn group_loads(&mut self) -> Result<Vec<GroupLoad>, ClientError> {
        Ok(self.master_request(&Command::GroupLoads).await?.loads)
    }

    /// Close every shard session, releasing all locks this client holds.
    pub async fn destroy(mut self) -> Result<(), ClientError> {
        let mut first_err = None;
        for (group, session) in self.sessions.drain() {
            if let Err(err) = session.close().await {
                tracing::warn!(group, error = ?err, "session close failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(ClientError::Transport(err)),
            None => Ok(()),
        }
    }

    fn remember(&mut self, lock: &str, resp: &Response) -> Option<GroupId> {
        let group = resp.group?;
        self.lock_groups.insert(lock.to_string(), group);
        if !resp.servers.is_empty() {
            self.group_servers.insert(group, resp.servers.clone());
        }
        Some(group)
    }

    async fn master_request(&self, cmd: &Command) -> Result<Response, ClientError> {
        let payload = encode_command(cmd)?;
        let reply = self
            .transport
            .send_singleton(&self.cfg.master, payload)
            .await
            .with_context(|| format!("{} request to master", cmd.function()))?;
        let resp = Response::decode(&reply).context("decode master reply")?;
        Ok(resp.into_result()?)
    }

    async fn shard_request(&mut self, lock: &str, cmd: &Command) -> Result<Response, ClientError> {
        for attempt in 0..2 {
            let cached = self.lock_groups.get(lock).copied();
            let group = match cached {
                Some(group) => group,
                None => self.locate_lock(lock).await?,
            };
            let resp = self.send_to_group(group, cmd).await?;
            match LockError::from_wire(&resp.err_message) {
                None => return Ok(resp),
                Some(LockError::LockNotFound) => {
                    tracing::debug!(lock, group, attempt, "lock not on cached shard; relocating");
                    self.invalidate(lock);
                }
                Some(err) => return Err(err.into()),
            }
        }
        Err(LockError::CannotLocateLock.into())
    }

    async fn send_to_group(&mut self, group: GroupId, cmd: &Command) -> Result<Response, ClientError> {
        let payload = encode_command(cmd)?;
        if !self.sessions.contains_key(&group) {
            let servers = self
                .group_servers
                .get(&group)
                .cloned()
                .ok_or(LockError::NoSessionForShard)?;
            let on_close = encode_command(&Command::ReleaseForClient {
                client: self.client_addr(),
            })?;
            let session = self
                .transport
                .open_session(&servers, Some(on_close))
                .await
                .with_context(|| format!("open session to group {group}"))?;
            tracing::debug!(group, "shard session opened");
            self.sessions.insert(group, session);
        }
        let session = self
            .sessions
            .get(&group)
            .ok_or(LockError::NoSessionForShard)?;
        let sent = session.send(payload).await;
        let reply = match sent {
            Ok(reply) => reply,
            Err(err) => {
                // Reopen lazily on the next call; the old session is not
                // closed so held locks stay held.
                self.sessions.remove(&group);
                return Err(err
                    .context(format!("{} request to group {group}", cmd.function()))
                    .into());
            }
        };
        Ok(Response::decode(&reply).context("decode shard reply")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::command::decode_command;

    /// Master always places locks on group 1; the shard never has them.
    #[derive(Clone, Default)]
    struct LostShard {
        locates: Arc<AtomicUsize>,
        shard_sends: Arc<AtomicUsize>,
    }

    struct LostSession(LostShard);

    #[async_trait]
    impl Session for LostSession {
        async fn send(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
            decode_command(&payload).map_err(|err| anyhow::anyhow!("{err}"))?;
            self.0.shard_sends.fetch_add(1, Ordering::SeqCst);
            Ok(Response::acquire_failed(&LockError::LockNotFound).encode())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for LostShard {
        fn local_addr(&self) -> ServerAddr {
            ServerAddr::from("client-1")
        }

        async fn open_session(
            &self,
            _servers: &[ServerAddr],
            _on_close: Option<Vec<u8>>,
        ) -> anyhow::Result<Box<dyn Session>> {
            Ok(Box::new(LostSession(self.clone())))
        }

        async fn send_singleton(
            &self,
            _servers: &[ServerAddr],
            payload: Vec<u8>,
        ) -> anyhow::Result<Vec<u8>> {
            match decode_command(&payload).map_err(|err| anyhow::anyhow!("{err}"))? {
                Command::LocateLock { lock } if lock == "gone" => {
                    Ok(Response::error(&LockError::LockNotFound).encode())
                }
                Command::LocateLock { .. } => {
                    self.locates.fetch_add(1, Ordering::SeqCst);
                    Ok(Response {
                        group: Some(1),
                        servers: vec![ServerAddr::from("shard-1")],
                        ..Response::ok()
                    }
                    .encode())
                }
                other => anyhow::bail!("unexpected master command: {other:?}"),
            }
        }
    }

    fn client(transport: LostShard) -> LockClient<LostShard> {
        LockClient::new(transport, ClientConfig::new(vec![ServerAddr::from("master")]))
    }

    #[tokio::test]
    async fn relocates_once_then_gives_up() {
        let transport = LostShard::default();
        let mut client = client(transport.clone());
        let err = client.acquire_lock("L").await.expect_err("lock never found");
        assert_eq!(err.lock_error(), Some(&LockError::CannotLocateLock));
        assert_eq!(transport.locates.load(Ordering::SeqCst), 2);
        assert_eq!(transport.shard_sends.load(Ordering::SeqCst), 2);
        assert_eq!(client.cached_group("L"), None);
    }

    #[tokio::test]
    async fn master_not_found_is_surfaced_verbatim() {
        let transport = LostShard::default();
        let mut client = client(transport.clone());
        let err = client.validate_lock("gone", 1).await.expect_err("unknown lock");
        assert_eq!(err.lock_error(), Some(&LockError::LockNotFound));
        assert_eq!(transport.shard_sends.load(Ordering::SeqCst), 0);
    }
}
