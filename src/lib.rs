//! Genesis: a queue-driven orchestration engine for multi-node blockchain test
//! networks.
//!
//! Commands arrive on a broker queue, wait on their dependencies in a ledger,
//! and are dispatched to order handlers. Protocol plugins build networks by
//! fanning shell operations out across every node of a fleet.

pub mod cli;
pub mod core;
pub mod protocols;
pub mod queue;
pub mod transport;
