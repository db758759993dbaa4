//! Job provisioning pipeline of the IDEA HPC scheduler.
//!
//! Jobs observed in an external batch scheduler are mirrored into a [`cache::JobCache`] by the
//! [`monitor::JobMonitor`], pushed into per queue profile [`provisioning::ProvisioningQueue`]s
//! and turned into cloud capacity by [`provisioning::JobProvisioner`]s.
#![deny(clippy::await_holding_lock)]

pub mod backend;
pub mod cache;
pub mod checks;
pub mod common;
pub mod config;
pub mod context;
pub mod events;
pub mod job;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod profiles;
pub mod provisioning;
pub mod queue_profile;
pub mod scheduler;
pub mod service;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::IdeaError;
pub type Result<T> = std::result::Result<T, Error>;

pub use common::{Map, Set, WrappedArcMutex};
pub use job::{Job, JobId, JobState};
pub use queue_profile::{QueueProfile, QueueProfileId};

pub const IDEA_SCHEDULER_VERSION: &str = env!("CARGO_PKG_VERSION");
