//! Controller fleet monitor.
//!
//! A pool of cooperating agents shares a store of controller records. Each
//! controller is watched by at most one agent at a time, arbitrated by a
//! lease held in the store. The owning agent consumes the controller's delta
//! stream and projects it into per-controller statistics and per-model
//! lifecycle records.

extern crate self as fleetmon;

pub mod api;
pub mod clock;
pub mod controller_monitor;
pub mod delta;
pub mod error;
pub mod fleet;
pub mod lease;
pub mod metrics;
pub mod record;
pub mod settings;
pub mod shutdown;
pub mod store;
pub mod trace;
pub mod watcher;
pub mod worker;

pub use fleetmon_macros::test;
