//! Entry point that wires the queue profile registry and the job monitor together.
use std::sync::Arc;

use crate::context::SchedulerContext;
use crate::events::JobEventSource;
use crate::monitor::JobMonitor;
use crate::profiles::{QueueProfileRegistry, QueueProfileStore};

pub struct ProvisioningService {
    ctx: SchedulerContext,
    registry: Arc<QueueProfileRegistry>,
    monitor: JobMonitor,
}

impl ProvisioningService {
    pub fn new(
        ctx: SchedulerContext,
        store: Arc<dyn QueueProfileStore>,
        events: Arc<dyn JobEventSource>,
    ) -> Self {
        let registry = Arc::new(QueueProfileRegistry::new(ctx.clone(), store));
        let monitor = JobMonitor::new(ctx.clone(), registry.clone(), events);
        Self {
            ctx,
            registry,
            monitor,
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<QueueProfileRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &JobMonitor {
        &self.monitor
    }

    /// Starts provisioners of enabled profiles, then synchronizes the job cache and starts
    /// monitoring jobs. Provisioners wait until the job cache is ready.
    pub async fn start(&mut self) -> crate::Result<()> {
        log::info!(
            "Starting provisioning service of cluster {} (version {})",
            self.ctx.config.cluster_name,
            crate::IDEA_SCHEDULER_VERSION
        );
        self.ctx.job_cache.set_ready(false);
        self.registry.start().await?;
        if let Err(error) = self.monitor.start().await {
            self.registry.stop().await;
            return Err(error);
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.monitor.stop().await;
        self.registry.stop().await;
        log::info!("Provisioning service stopped");
    }
}
