//! Sharded lock service.
//!
//! Locks live in a hierarchical namespace of domains and are partitioned
//! across independently replicated shard groups. A replicated master owns the
//! domain tree and the lock-to-shard assignment and moves locks between
//! shards when load drifts apart. Clients cache lock locations and talk to
//! shards directly.

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod load;
pub mod master;
pub mod rebalance;
pub mod shard;

pub use client::LockClient;
pub use command::{Command, Response};
pub use config::{ClientConfig, MasterConfig, RebalanceConfig, ShardConfig, ShardGroup};
pub use error::{ClientError, LockError};
pub use master::MasterStateMachine;
pub use shard::ShardStateMachine;
