//! Queue profile registry: persistence, cached lookups and the live provisioning pipelines of
//! enabled profiles.
pub mod cache;
pub mod registry;
pub mod store;

pub use registry::{ProfileKey, QueueProfileRegistry, QueueProfileWithStatus};
pub use store::{InMemoryQueueProfileStore, QueueProfileStore};
