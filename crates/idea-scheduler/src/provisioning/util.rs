//! Per job group admission checks and capacity decisions.
use std::collections::BTreeMap;

use chrono::Utc;
use itertools::Itertools;

use crate::backend::{BackendError, StackRequest};
use crate::checks::{QuotaKind, ReservationDemand};
use crate::common::table::render_table;
use crate::context::SchedulerContext;
use crate::job::{CapacityType, Job, JobId, ProvisioningOptions};
use crate::provisioning::capacity::{BatchCapacityHelper, CapacityPlan};
use crate::provisioning::error::{ErrorCode, ProvisioningError, ProvisioningResult};
use crate::provisioning::queue::QueueItem;
use crate::provisioning::status::{
    ProvisioningCapacityInfo, ProvisioningStatus, evaluate_stack_status,
};
use crate::queue_profile::QueueProfile;

fn backend_error(error: BackendError) -> ProvisioningError {
    ProvisioningError::retryable(ErrorCode::BackendError, format!("{error:#}"))
}

fn quota_kinds(capacity_type: CapacityType) -> &'static [QuotaKind] {
    match capacity_type {
        CapacityType::OnDemand => &[QuotaKind::OnDemand],
        CapacityType::Spot => &[QuotaKind::Spot],
        CapacityType::Mixed => &[QuotaKind::OnDemand, QuotaKind::Spot],
    }
}

/// Outcome of releasing the jobs of a batch onto a stack.
#[derive(Default)]
struct Release {
    provisioned: Vec<JobId>,
    failed: Vec<JobId>,
    failure: Option<ProvisioningError>,
}

impl Release {
    /// `uncovered` are jobs of the batch that did not fit under the capacity limit.
    fn into_result(
        self,
        mut uncovered: Vec<JobId>,
        job_group: &str,
    ) -> ProvisioningResult<Vec<JobId>> {
        if uncovered.is_empty() && self.failed.is_empty() {
            return Ok(self.provisioned);
        }
        let failure = self.failure.unwrap_or_else(|| {
            ProvisioningError::retryable(
                ErrorCode::CapacityLimitReached,
                format!("capacity limit of job group {job_group} reached"),
            )
        });
        if self.provisioned.is_empty() {
            return Err(failure);
        }
        uncovered.extend(self.failed);
        Err(ProvisioningError::PartialBatchFailure {
            provisioned: self.provisioned,
            unprovisioned: uncovered,
            code: failure.code(),
            reason: failure.reason().to_string(),
        })
    }
}

/// Decides how the capacity of a job group is provided and performs it.
pub struct ProvisioningUtil {
    ctx: SchedulerContext,
    profile: QueueProfile,
}

impl ProvisioningUtil {
    pub fn new(ctx: SchedulerContext, profile: QueueProfile) -> Self {
        Self { ctx, profile }
    }

    pub fn stack_name(&self, job_group: &str) -> String {
        self.profile
            .stack_name(&self.ctx.config.cluster_name, job_group)
    }

    /// Evaluates the stack providing capacity to `job_group`.
    pub async fn check_status(&self, job_group: &str) -> ProvisioningResult<ProvisioningCapacityInfo> {
        let stack_name = self.stack_name(job_group);
        let stack = match self.ctx.backend.describe_stack(&stack_name).await {
            Ok(stack) => Some(stack),
            Err(BackendError::NotFound(_)) => None,
            Err(error) => return Err(backend_error(error)),
        };
        let status = evaluate_stack_status(
            stack.as_ref(),
            self.ctx.config.provisioning.stack_provisioning_timeout,
            Utc::now(),
        );
        log::debug!("Capacity of job group {job_group} (stack {stack_name}): {status}");
        Ok(ProvisioningCapacityInfo {
            stack_name,
            status,
            stack,
        })
    }

    /// Fills in the instance type options of the jobs from the backend.
    pub async fn resolve_provisioning_options(&self, items: &mut [QueueItem]) -> ProvisioningResult<()> {
        let mut resolved: Vec<(Vec<String>, ProvisioningOptions)> = vec![];
        for item in items.iter_mut() {
            if item.job.params.instance_types.is_empty() {
                return Err(ProvisioningError::config(format!(
                    "job {} does not request any instance type",
                    item.job.job_id
                )));
            }
            if item.job.provisioning_options.is_some() {
                continue;
            }
            let instance_types = item.job.params.instance_types.clone();
            let options = match resolved.iter().find(|(types, _)| *types == instance_types) {
                Some((_, options)) => options.clone(),
                None => {
                    let options = ProvisioningOptions {
                        instance_types: self
                            .ctx
                            .backend
                            .describe_instance_types(&instance_types)
                            .await
                            .map_err(backend_error)?,
                    };
                    resolved.push((instance_types, options.clone()));
                    options
                }
            };
            item.job.provisioning_options = Some(options);
            self.ctx.job_cache.sync([item.job.clone()]);
        }
        Ok(())
    }

    pub async fn check_budgets(&self, jobs: &[&Job]) -> ProvisioningResult<()> {
        let projects = jobs
            .iter()
            .filter_map(|job| job.project.as_deref())
            .unique()
            .collect::<Vec<_>>();
        for project in projects {
            let budget = self
                .ctx
                .checks
                .budgets
                .get_budget(project)
                .await
                .map_err(|error| {
                    ProvisioningError::retryable(
                        ErrorCode::BackendError,
                        format!("cannot read budget of project {project}: {error:#}"),
                    )
                })?;
            if let Some(budget) = budget.filter(|budget| budget.is_exceeded()) {
                return Err(ProvisioningError::retryable(
                    ErrorCode::BudgetExceeded,
                    format!(
                        "budget {} of project {project} is exceeded (actual spend: {:.2}, limit: {:.2})",
                        budget.budget_name, budget.actual_spend, budget.limit
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Checks that at least one requested instance type has enough vCPU quota for the whole
    /// batch, for every purchase option the batch uses.
    pub async fn check_service_quota(&self, jobs: &[&Job]) -> ProvisioningResult<()> {
        let Some(first) = jobs.first() else {
            return Ok(());
        };
        let requested: u32 = jobs.iter().map(|job| job.requested_vcpus()).sum();
        for kind in quota_kinds(first.params.capacity_type()) {
            let mut rows = vec![];
            let mut available = false;
            for instance_type in &first.params.instance_types {
                let quota = self
                    .ctx
                    .checks
                    .quotas
                    .get_quota(*kind, instance_type)
                    .await
                    .map_err(|error| {
                        ProvisioningError::retryable(
                            ErrorCode::BackendError,
                            format!("cannot read {kind:?} quota of {instance_type}: {error:#}"),
                        )
                    })?;
                if quota.available_vcpus() >= requested {
                    available = true;
                    break;
                }
                rows.push(vec![
                    instance_type.clone(),
                    quota.quota_name.clone(),
                    quota.limit_vcpus.to_string(),
                    quota.used_vcpus.to_string(),
                    quota.available_vcpus().to_string(),
                    requested.to_string(),
                ]);
            }
            if !available {
                let table = render_table(
                    &["Instance type", "Quota", "Limit", "Used", "Available", "Requested"],
                    rows,
                );
                return Err(ProvisioningError::retryable(
                    ErrorCode::ServiceQuotaNotAvailable,
                    format!("not enough {kind:?} vCPU quota for {requested} vCPUs\n{table}"),
                ));
            }
        }
        Ok(())
    }

    /// Only applies when a job forces the use of reserved instances.
    pub async fn check_reserved_instance_usage(&self, jobs: &[&Job]) -> ProvisioningResult<()> {
        if !jobs.iter().any(|job| job.params.force_reserved_instances) {
            return Ok(());
        }
        let Some(first) = jobs.first() else {
            return Ok(());
        };
        let instance_types = &first.params.instance_types;
        let desired_capacity: u32 = jobs.iter().map(|job| job.desired_capacity()).sum();
        let demand: Vec<ReservationDemand> = instance_types
            .iter()
            .map(|instance_type| ReservationDemand {
                instance_type: instance_type.clone(),
                weighted_capacity: first
                    .provisioning_options
                    .as_ref()
                    .and_then(|options| options.get(instance_type))
                    .map(|option| option.weighted_capacity)
                    .unwrap_or(1),
                desired_capacity,
            })
            .collect();
        let usage = self
            .ctx
            .checks
            .reservations
            .get_reservations(instance_types)
            .await
            .map_err(|error| {
                ProvisioningError::retryable(
                    ErrorCode::BackendError,
                    format!("cannot read reserved instances: {error:#}"),
                )
            })?;
        if let Err(shortfalls) = self.ctx.checks.reservation_policy.check(&usage, &demand) {
            let rows = shortfalls
                .iter()
                .map(|s| {
                    vec![
                        s.instance_type.clone(),
                        s.purchased.to_string(),
                        s.running.to_string(),
                        s.needed.to_string(),
                        s.missing().to_string(),
                    ]
                })
                .collect();
            let table = render_table(
                &["Instance type", "Purchased", "Running", "Needed", "Missing"],
                rows,
            );
            return Err(ProvisioningError::retryable(
                ErrorCode::ReservedInstancesNotAvailable,
                format!("not enough reserved instances\n{table}"),
            ));
        }
        Ok(())
    }

    pub async fn check_licenses(&self, jobs: &[&Job]) -> ProvisioningResult<()> {
        let mut asks: BTreeMap<&str, u32> = BTreeMap::new();
        for license in jobs.iter().flat_map(|job| job.params.licenses.iter()) {
            *asks.entry(license.name.as_str()).or_default() += license.count;
        }
        for (name, ask) in asks {
            let available = self
                .ctx
                .checks
                .licenses
                .available_licenses(name)
                .await
                .map_err(|error| {
                    ProvisioningError::retryable(
                        ErrorCode::LicenseNotAvailable,
                        format!("cannot read available licenses of {name}: {error:#}"),
                    )
                })?;
            let active = self.ctx.job_cache.get_active_license_count(name);
            if available < active.saturating_add(ask) {
                return Err(ProvisioningError::retryable(
                    ErrorCode::LicenseNotAvailable,
                    format!(
                        "license {name} is not available (available: {available}, in use: {active}, requested: {ask})"
                    ),
                ));
            }
        }
        Ok(())
    }

    pub async fn ec2_dry_run(&self, job: &Job) -> ProvisioningResult<()> {
        for instance_type in &job.params.instance_types {
            if let Err(error) = self.ctx.backend.dry_run(instance_type, &job.params).await {
                return Err(ProvisioningError::retryable(
                    ErrorCode::DryRunFailed,
                    format!("dry run of {instance_type} failed: {error:#}"),
                ));
            }
        }
        Ok(())
    }

    async fn run_checks(&self, jobs: &[&Job]) -> ProvisioningResult<()> {
        let Some(first) = jobs.first() else {
            return Ok(());
        };
        self.check_budgets(jobs).await?;
        self.ec2_dry_run(first).await?;
        self.check_service_quota(jobs).await?;
        self.check_reserved_instance_usage(jobs).await?;
        self.check_licenses(jobs).await
    }

    /// Provisions a batch of jobs of one job group. Returns the ids of provisioned jobs.
    pub async fn provision(&self, items: &mut [QueueItem]) -> ProvisioningResult<Vec<JobId>> {
        let Some(first) = items.first() else {
            return Ok(vec![]);
        };
        let job_group = first.entry.job_group.clone();
        self.resolve_provisioning_options(items).await?;
        let info = self.check_status(&job_group).await?;
        match info.status {
            ProvisioningStatus::NotProvisioned => self.create_new_stack(items, &job_group).await,
            ProvisioningStatus::Completed => {
                if self.profile.is_shared_capacity() {
                    self.update_capacity(items, &info).await
                } else {
                    // Stack of an ephemeral job that was not released yet
                    let stack_id = info.stack_id().unwrap_or_default().to_string();
                    let release = self.release_onto_stack(items.iter(), &stack_id).await;
                    release.into_result(vec![], &job_group)
                }
            }
            ProvisioningStatus::InProgress => Err(ProvisioningError::retryable(
                ErrorCode::StackInProgress,
                format!("stack {} is being created", info.stack_name),
            )),
            ProvisioningStatus::DeleteInProgress => Err(ProvisioningError::retryable(
                ErrorCode::StackDeleteInProgress,
                format!("stack {} is being deleted", info.stack_name),
            )),
            ProvisioningStatus::Failed => Err(ProvisioningError::terminal(
                ErrorCode::StackFailed,
                format!("stack {} failed", info.stack_name),
            )),
            ProvisioningStatus::Timeout => Err(ProvisioningError::terminal(
                ErrorCode::StackTimeout,
                format!(
                    "stack {} did not provide capacity within {}",
                    info.stack_name,
                    humantime::format_duration(self.ctx.config.provisioning.stack_provisioning_timeout)
                ),
            )),
        }
    }

    fn capacity_plan(&self, items: &[QueueItem], current_target: u32, job_group: &str) -> CapacityPlan {
        let used = self.ctx.job_cache.get_provisioned_capacity(job_group);
        let max_capacity = if self.profile.is_batch() {
            self.profile.limits.max_provisioned_capacity
        } else {
            None
        };
        BatchCapacityHelper::new(current_target, used, max_capacity)
            .plan(items.iter().map(|item| &item.job))
    }

    /// Builds a new stack for the job group and releases the covered jobs onto it.
    pub async fn create_new_stack(
        &self,
        items: &[QueueItem],
        job_group: &str,
    ) -> ProvisioningResult<Vec<JobId>> {
        let Some(first) = items.first() else {
            return Ok(vec![]);
        };
        let jobs: Vec<&Job> = items.iter().map(|item| &item.job).collect();
        self.run_checks(&jobs).await?;

        let plan = self.capacity_plan(items, 0, job_group);
        if plan.covered.is_empty() {
            return Err(ProvisioningError::retryable(
                ErrorCode::CapacityLimitReached,
                format!("no job of group {job_group} fits under the capacity limit"),
            ));
        }
        let job = &first.job;
        let request = StackRequest {
            stack_name: self.stack_name(job_group),
            cluster_name: self.ctx.config.cluster_name.clone(),
            queue_profile: self.profile.name.clone(),
            queues: self.profile.queues.clone(),
            job_group: job_group.to_string(),
            job_ids: plan.covered.clone(),
            params: job.params.clone(),
            capacity_type: job.params.capacity_type(),
            target_capacity: plan.target_capacity,
            is_shared_resource: self.profile.is_shared_capacity(),
            keep_forever: self.profile.keep_forever,
            terminate_when_idle: self.profile.terminate_when_idle,
        };
        log::info!(
            "Creating stack {} for {} job(s) of group {job_group} (target capacity: {})",
            request.stack_name,
            plan.covered.len(),
            plan.target_capacity
        );
        let stack_id = self.ctx.backend.build(request).await.map_err(backend_error)?;

        let covered: Vec<&QueueItem> = items
            .iter()
            .filter(|item| plan.covered.contains(&item.job.job_id))
            .collect();
        let release = self.release_onto_stack(covered, &stack_id).await;
        release.into_result(plan.uncovered, job_group)
    }

    /// Releases the jobs onto a stack one by one. A job refused by the scheduler does not stop
    /// the release of the remaining jobs.
    async fn release_onto_stack<'a>(
        &self,
        items: impl IntoIterator<Item = &'a QueueItem>,
        stack_id: &str,
    ) -> Release {
        let mut release = Release::default();
        for item in items {
            match self.provision_job_in_scheduler(&item.job, stack_id).await {
                Ok(_) => release.provisioned.push(item.job.job_id.clone()),
                Err(error) => {
                    log::debug!(
                        "Job {} not released onto stack {stack_id}: {error}",
                        item.job.log_tag()
                    );
                    release.failed.push(item.job.job_id.clone());
                    release.failure.get_or_insert(error);
                }
            }
        }
        release
    }

    /// Grows the capacity of an existing shared stack and releases the jobs onto it.
    pub async fn update_capacity(
        &self,
        items: &[QueueItem],
        info: &ProvisioningCapacityInfo,
    ) -> ProvisioningResult<Vec<JobId>> {
        let Some(first) = items.first() else {
            return Ok(vec![]);
        };
        let job_group = first.entry.job_group.as_str();
        let new_jobs: Vec<&Job> = items
            .iter()
            .filter(|item| !item.entry.capacity_added)
            .map(|item| &item.job)
            .collect();
        self.run_checks(&new_jobs).await?;

        let backend = &self.ctx.backend;
        let resource = backend
            .describe_stack_resources(&info.stack_name)
            .await
            .map_err(backend_error)?;
        let capacity = backend
            .describe_capacity(&resource)
            .await
            .map_err(backend_error)?;
        let plan = self.capacity_plan(items, capacity.target_capacity, job_group);
        if plan.target_capacity != capacity.target_capacity {
            if !capacity.is_modifiable(&resource) {
                return Err(ProvisioningError::retryable(
                    ErrorCode::CapacityUpdateInProgress,
                    format!(
                        "capacity of stack {} cannot be modified now (request state: {}, activity: {})",
                        info.stack_name,
                        capacity.request_state.as_deref().unwrap_or("-"),
                        capacity.activity_status.as_deref().unwrap_or("-")
                    ),
                ));
            }
            log::info!(
                "Updating capacity of stack {} from {} to {}",
                info.stack_name,
                capacity.target_capacity,
                plan.target_capacity
            );
            backend
                .modify_target_capacity(&resource, plan.target_capacity)
                .await
                .map_err(backend_error)?;
        }

        let mut release = Release::default();
        for item in items
            .iter()
            .filter(|item| !plan.uncovered.contains(&item.job.job_id))
        {
            match self
                .provision_job_on_shared_capacity(&item.job, info, plan.target_capacity)
                .await
            {
                Ok(()) => release.provisioned.push(item.job.job_id.clone()),
                Err(error) => {
                    log::debug!(
                        "Job {} not provisioned on stack {}: {error}",
                        item.job.log_tag(),
                        info.stack_name
                    );
                    release.failed.push(item.job.job_id.clone());
                    release.failure.get_or_insert(error);
                }
            }
        }
        release.into_result(plan.uncovered, job_group)
    }

    /// Releases a job onto an existing shared stack with `target_capacity` capacity units.
    pub async fn provision_job_on_shared_capacity(
        &self,
        job: &Job,
        info: &ProvisioningCapacityInfo,
        target_capacity: u32,
    ) -> ProvisioningResult<()> {
        let Some(stack) = info.stack.as_ref() else {
            return Err(ProvisioningError::retryable(
                ErrorCode::InsufficientCapacity,
                format!("stack {} does not exist", info.stack_name),
            ));
        };
        let group_matches = match (&stack.job_group, &job.job_group) {
            (Some(stack_group), Some(job_group)) => stack_group == job_group,
            (None, _) => true,
            (Some(_), None) => false,
        };
        let queue_matches = stack.queues.is_empty() || stack.queues.contains(&job.queue);
        if !group_matches || !queue_matches {
            return Err(ProvisioningError::terminal(
                ErrorCode::JobGroupMismatch,
                format!(
                    "job {} (group: {}, queue: {}) does not match stack {} (group: {}, queues: {})",
                    job.job_id,
                    job.job_group.as_deref().unwrap_or("-"),
                    job.queue,
                    stack.stack_name,
                    stack.job_group.as_deref().unwrap_or("-"),
                    stack.queues.join(",")
                ),
            ));
        }
        let job_group = job.job_group.as_deref().unwrap_or_default();
        let used = self.ctx.job_cache.get_provisioned_capacity(job_group);
        let desired = job.desired_capacity();
        if used.saturating_add(desired) > target_capacity {
            return Err(ProvisioningError::retryable(
                ErrorCode::InsufficientCapacity,
                format!(
                    "stack {} has no free capacity (capacity: {target_capacity}, used: {used}, desired: {desired})",
                    stack.stack_name
                ),
            ));
        }
        self.provision_job_in_scheduler(job, &stack.stack_id).await?;
        Ok(())
    }

    /// Marks the job as provisioned in the scheduler and in the job cache.
    pub async fn provision_job_in_scheduler(&self, job: &Job, stack_id: &str) -> ProvisioningResult<Job> {
        let provisioning_time = self
            .ctx
            .scheduler
            .provision_job(job, stack_id)
            .await
            .map_err(|error| {
                ProvisioningError::retryable(
                    ErrorCode::SchedulerError,
                    format!("cannot provision job {}: {error:#}", job.job_id),
                )
            })?;
        let mut job = job.clone();
        job.provisioned = true;
        job.provisioning_time = Some(provisioning_time);
        job.stack_id = Some(stack_id.to_string());

        let cache = &self.ctx.job_cache;
        cache.sync([job.clone()]);
        cache.clear_job_provisioning_error(&job.job_id);
        let latency = job
            .queue_time
            .and_then(|queued| (provisioning_time - queued).to_std().ok());
        self.ctx.metrics.job_provisioned(latency);
        log::info!(
            "Job {} provisioned on stack {stack_id} (latency: {})",
            job.log_tag(),
            latency
                .map(|l| humantime::format_duration(l).to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        Ok(job)
    }

    /// Deletes a failed stack of ephemeral jobs so that they can be provisioned again.
    pub async fn cleanup_ephemeral_stack(&self, job_group: &str, job_ids: &[JobId]) {
        if self.profile.is_shared_capacity() {
            return;
        }
        let stack_name = self.stack_name(job_group);
        match self.ctx.backend.delete_stack(&stack_name).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                log::info!("Stack {stack_name} of job group {job_group} deleted")
            }
            Err(error) => log::warn!("Cannot delete stack {stack_name}: {error:#}"),
        }
        for job_id in job_ids {
            self.ctx.job_cache.reset_provisioning(job_id);
        }
    }
}
