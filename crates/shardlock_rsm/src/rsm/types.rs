//! Shared types for the replicated state machine contract.
//!
//! These types are kept small and dependency-light because they are used by
//! both the state machines (shard, master) and the session/transport layer.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logical identifier for a replica group (shard or master cluster).
pub type GroupId = u64;

/// Network address of one replica-group member or client endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerAddr(String);

impl ServerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerAddr {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerAddr {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Metadata attached to a committed entry.
///
/// `unix_ms` is stamped once by the proposer, so every replica that applies
/// the entry observes the same timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecMeta {
    pub index: u64,
    pub unix_ms: u64,
}

/// Deferred side effect returned from `apply`.
///
/// The substrate sends `command` to the cluster reachable at `target` after
/// the originating entry commits, outside the state machine's lock, and only
/// from the current leader. The receiving cluster commits it as a new entry,
/// so a dropped effect is never partially visible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Effect {
    pub target: Vec<ServerAddr>,
    pub command: Vec<u8>,
}

/// Result of applying one committed entry.
#[derive(Clone, Debug, Default)]
pub struct Applied {
    pub response: Vec<u8>,
    pub effects: Vec<Effect>,
}

impl Applied {
    pub fn reply(response: Vec<u8>) -> Self {
        Self {
            response,
            effects: Vec::new(),
        }
    }
}

/// Application-specific state machine driven by the replicated log.
///
/// The log treats commands as opaque bytes. `apply` must be deterministic:
/// the same entry sequence yields the same state, responses, and effects on
/// every replica.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, data: &[u8], meta: ExecMeta) -> Applied;

    /// Serialize the full state for log compaction or replica catch-up.
    fn snapshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Replace the in-memory state wholesale with a snapshot.
    fn restore(&self, snapshot: &[u8]) -> anyhow::Result<()>;
}

/// Logical, possibly reconnecting channel to one replica group's leader.
#[async_trait]
pub trait Session: Send + Sync {
    async fn send(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>>;

    /// Tear the session down, committing its on-close command (if any).
    async fn close(&self) -> anyhow::Result<()>;
}

/// Client-side entry point into the substrate.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of the local endpoint; used as the lock holder identity.
    fn local_addr(&self) -> ServerAddr;

    async fn open_session(
        &self,
        servers: &[ServerAddr],
        on_close: Option<Vec<u8>>,
    ) -> anyhow::Result<Box<dyn Session>>;

    /// Send one command to a fixed cluster and wait for exactly one reply.
    async fn send_singleton(
        &self,
        servers: &[ServerAddr],
        payload: Vec<u8>,
    ) -> anyhow::Result<Vec<u8>>;
}
