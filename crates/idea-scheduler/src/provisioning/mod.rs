pub mod capacity;
pub mod error;
pub mod fairshare;
pub mod provisioner;
pub mod queue;
pub mod status;
pub mod util;

pub use error::{ErrorCode, ProvisioningError, ProvisioningResult};
pub use provisioner::JobProvisioner;
pub use queue::{ProvisioningQueue, QueueError, QueueStatus};
pub use status::ProvisioningStatus;
pub use util::ProvisioningUtil;
