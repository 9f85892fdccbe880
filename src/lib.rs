//! Offline-first response cache and background sync engine.
//!
//! Requests are classified into tiers and served with a per-tier strategy.
//! Mutations that cannot reach the network are queued durably and replayed
//! by the sync scheduler once connectivity returns.

pub mod cache;
pub mod classify;
pub mod clock;
pub mod config;
pub mod engine;
pub mod logging;
pub mod messenger;
pub mod net;
pub mod queue;
pub mod strategy;
pub mod sync;

pub use config::Config;
pub use engine::{Engine, EngineEvent, EventOutcome, Providers};
pub use messenger::{ControlMessage, Notification, Reply, StatusReport};
