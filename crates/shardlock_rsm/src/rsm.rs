//! Substrate module wiring.
//!
//! `types` defines the shared contracts (state machine, effects, transport,
//! session) and `local` is the in-process replica-group implementation.

mod local;
mod types;

pub use local::{LocalGroup, LocalGroupConfig, LocalNetwork, LocalSession, LocalTransport};
pub use types::{Applied, Effect, ExecMeta, GroupId, ServerAddr, Session, StateMachine, Transport};
