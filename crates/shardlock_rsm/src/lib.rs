//! Replicated state machine substrate for shardlock.
//!
//! This crate states the contract the lock service relies on: committed
//! entries are applied in one total order on every replica, post-commit
//! effects are dispatched by the leader only, and clients reach a group
//! through sessions that may carry an on-close command. Higher layers supply
//! a `StateMachine`; an in-process `LocalNetwork` drives it for tests and
//! the workload driver.

pub mod rsm;
