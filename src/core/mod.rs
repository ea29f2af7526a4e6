//! Core engine: types, configuration, dependency ledger, build state, fleet
//! execution, handler registry and the delivery handler tying them together.

pub mod config;
pub mod eventlog;
pub mod executor;
pub mod handler;
pub mod ledger;
pub mod registry;
pub mod state;
pub mod types;
