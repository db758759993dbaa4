use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::backend::{
    BackendError, BackendResult, CapacityResource, FleetCapacity, ProvisioningBackend,
    StackInfo, StackRequest, StackStatus,
};
use crate::checks::{
    AdmissionChecks, BudgetChecker, BudgetStatus, LicenseChecker, QuotaChecker, QuotaInfo,
    QuotaKind, ReservationSource, ReservationUsage, UnscopedReservationPolicy,
};
use crate::common::{Map, WrappedArcMutex};
use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;
use crate::job::{InstanceTypeOption, Job, JobId, JobParams, JobState};
use crate::notify::JobNotifier;
use crate::scheduler::{
    BatchScheduler, JOB_GROUP_RESOURCE, ListJobsRequest, QueueCreation, SchedulerResult,
};
use crate::tests::utils::init_logging;

#[derive(Default)]
struct SchedulerState {
    jobs: BTreeMap<JobId, Job>,
    queues: BTreeSet<String>,
    deleted_queues: Vec<String>,
    provisioned: Vec<JobId>,
    count_calls: usize,
    refused_jobs: BTreeSet<JobId>,
    failing_queues: BTreeSet<String>,
    failing_counts: u32,
}

/// In-memory batch scheduler.
#[derive(Default)]
pub struct MockScheduler {
    state: WrappedArcMutex<SchedulerState>,
}

impl MockScheduler {
    pub fn add_job(&self, job: Job) {
        self.state.get_mut().jobs.insert(job.job_id.clone(), job);
    }

    pub fn remove_job(&self, job_id: &str) {
        self.state.get_mut().jobs.remove(job_id);
    }

    pub fn set_job_state(&self, job_id: &str, state: JobState) {
        if let Some(job) = self.state.get_mut().jobs.get_mut(job_id) {
            job.state = state;
        }
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.state.get_mut().jobs.get(job_id).cloned()
    }

    pub fn queues(&self) -> Vec<String> {
        self.state.get_mut().queues.iter().cloned().collect()
    }

    pub fn add_queue(&self, queue: &str) {
        self.state.get_mut().queues.insert(queue.to_string());
    }

    /// Removes a queue without recording it as deleted through the scheduler API.
    pub fn forget_queue(&self, queue: &str) {
        self.state.get_mut().queues.remove(queue);
    }

    pub fn deleted_queues(&self) -> Vec<String> {
        self.state.get_mut().deleted_queues.clone()
    }

    pub fn provisioned_jobs(&self) -> Vec<JobId> {
        self.state.get_mut().provisioned.clone()
    }

    pub fn count_calls(&self) -> usize {
        self.state.get_mut().count_calls
    }

    /// The next release of the job onto a stack fails.
    pub fn refuse_job_once(&self, job_id: &str) {
        self.state.get_mut().refused_jobs.insert(job_id.to_string());
    }

    /// Listing jobs of the queue fails until the queue is restored.
    pub fn fail_listing(&self, queue: &str) {
        self.state.get_mut().failing_queues.insert(queue.to_string());
    }

    pub fn restore_listing(&self, queue: &str) {
        self.state.get_mut().failing_queues.remove(queue);
    }

    pub fn fail_counts(&self, count: u32) {
        self.state.get_mut().failing_counts = count;
    }
}

impl BatchScheduler for MockScheduler {
    fn list_jobs(&self, request: ListJobsRequest) -> BoxFuture<'_, SchedulerResult<Vec<Job>>> {
        Box::pin(async move {
            let state = self.state.get_mut();
            if let Some(queue) = request
                .queue
                .as_ref()
                .filter(|queue| state.failing_queues.contains(*queue))
            {
                return Err(anyhow!("Cannot list jobs of queue {queue}: server timeout"));
            }
            let jobs = state
                .jobs
                .values()
                .filter(|job| request.matches(job))
                .take(request.max_jobs.unwrap_or(usize::MAX))
                .cloned()
                .collect();
            Ok(jobs)
        })
    }

    fn get_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, SchedulerResult<Option<Job>>> {
        Box::pin(async move { Ok(self.job(job_id)) })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, SchedulerResult<()>> {
        Box::pin(async move {
            self.remove_job(job_id);
            Ok(())
        })
    }

    fn create_queue<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<QueueCreation>> {
        Box::pin(async move {
            if self.state.get_mut().queues.insert(queue.to_string()) {
                Ok(QueueCreation::Created)
            } else {
                Ok(QueueCreation::AlreadyExists)
            }
        })
    }

    fn delete_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, SchedulerResult<()>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            if !state.queues.remove(queue) {
                return Err(anyhow!("Unknown queue {queue}"));
            }
            state.deleted_queues.push(queue.to_string());
            Ok(())
        })
    }

    fn modify_job_resources<'a>(
        &'a self,
        job_id: &'a str,
        resources: Vec<(String, String)>,
    ) -> BoxFuture<'a, SchedulerResult<()>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| anyhow!("Unknown Job Id {job_id}"))?;
            for (name, value) in resources {
                if name == JOB_GROUP_RESOURCE {
                    job.job_group = Some(value.clone());
                }
                job.params.custom.insert(name, value);
            }
            Ok(())
        })
    }

    fn provision_job<'a>(
        &'a self,
        job: &'a Job,
        stack_id: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<DateTime<Utc>>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            if state.refused_jobs.remove(&job.job_id) {
                return Err(anyhow!("qalter: cannot modify job {}", job.job_id));
            }
            if let Some(job) = state.jobs.get_mut(&job.job_id) {
                job.provisioned = true;
                job.stack_id = Some(stack_id.to_string());
            }
            state.provisioned.push(job.job_id.clone());
            Ok(Utc::now())
        })
    }

    fn count_queued_jobs<'a>(
        &'a self,
        queues: &'a [String],
        job_group: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<u32>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            state.count_calls += 1;
            if state.failing_counts > 0 {
                state.failing_counts -= 1;
                return Err(anyhow!("qselect: server timeout"));
            }
            let count = state
                .jobs
                .values()
                .filter(|job| {
                    queues.contains(&job.queue)
                        && job.state.is_queued_or_held()
                        && job.job_group.as_deref() == Some(job_group)
                })
                .count();
            Ok(count as u32)
        })
    }
}

#[derive(Default)]
struct BackendState {
    stacks: BTreeMap<String, StackInfo>,
    capacities: BTreeMap<String, (CapacityResource, FleetCapacity)>,
    builds: Vec<StackRequest>,
    build_attempts: usize,
    failing_builds: u32,
    describe_failure: Option<String>,
    dry_run_failures: BTreeMap<String, String>,
    capacity_updates: Vec<u32>,
    deleted_stacks: Vec<String>,
}

/// In-memory provisioning backend. Built stacks are complete immediately.
#[derive(Default)]
pub struct MockBackend {
    state: WrappedArcMutex<BackendState>,
}

impl MockBackend {
    pub fn add_stack(&self, stack: StackInfo) {
        self.state
            .get_mut()
            .stacks
            .insert(stack.stack_name.clone(), stack);
    }

    pub fn set_stack_status(&self, stack_name: &str, status: StackStatus) {
        if let Some(stack) = self.state.get_mut().stacks.get_mut(stack_name) {
            stack.status = status;
        }
    }

    pub fn set_capacity(
        &self,
        stack_name: &str,
        resource: CapacityResource,
        capacity: FleetCapacity,
    ) {
        self.state
            .get_mut()
            .capacities
            .insert(stack_name.to_string(), (resource, capacity));
    }

    pub fn fail_builds(&self, count: u32) {
        self.state.get_mut().failing_builds = count;
    }

    pub fn fail_describe(&self, message: &str) {
        self.state.get_mut().describe_failure = Some(message.to_string());
    }

    pub fn fail_dry_run(&self, instance_type: &str, message: &str) {
        self.state
            .get_mut()
            .dry_run_failures
            .insert(instance_type.to_string(), message.to_string());
    }

    pub fn builds(&self) -> Vec<StackRequest> {
        self.state.get_mut().builds.clone()
    }

    pub fn build_attempts(&self) -> usize {
        self.state.get_mut().build_attempts
    }

    pub fn capacity_updates(&self) -> Vec<u32> {
        self.state.get_mut().capacity_updates.clone()
    }

    pub fn deleted_stacks(&self) -> Vec<String> {
        self.state.get_mut().deleted_stacks.clone()
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.state.get_mut().stacks.keys().cloned().collect()
    }
}

impl ProvisioningBackend for MockBackend {
    fn build(&self, request: StackRequest) -> BoxFuture<'_, BackendResult<String>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            state.build_attempts += 1;
            if state.failing_builds > 0 {
                state.failing_builds -= 1;
                return Err(anyhow!("Rate exceeded").into());
            }
            let stack_id = format!("stack-{}", state.builds.len() + 1);
            state.stacks.insert(
                request.stack_name.clone(),
                StackInfo {
                    stack_name: request.stack_name.clone(),
                    stack_id: stack_id.clone(),
                    status: StackStatus::CreateComplete,
                    creation_time: Utc::now(),
                    is_shared_resource: request.is_shared_resource,
                    job_group: Some(request.job_group.clone()),
                    queue_profile: Some(request.queue_profile.clone()),
                    queues: request.queues.clone(),
                },
            );
            state.capacities.insert(
                request.stack_name.clone(),
                (
                    CapacityResource::AutoScalingGroup {
                        name: format!("{}-asg", request.stack_name),
                    },
                    FleetCapacity {
                        target_capacity: request.target_capacity,
                        fulfilled_capacity: 0,
                        request_state: None,
                        activity_status: None,
                    },
                ),
            );
            state.builds.push(request);
            Ok(stack_id)
        })
    }

    fn describe_stack<'a>(&'a self, stack_name: &'a str) -> BoxFuture<'a, BackendResult<StackInfo>> {
        Box::pin(async move {
            let state = self.state.get_mut();
            if let Some(message) = &state.describe_failure {
                return Err(anyhow!("{message}").into());
            }
            state
                .stacks
                .get(stack_name)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(stack_name.to_string()))
        })
    }

    fn describe_stack_resources<'a>(
        &'a self,
        stack_name: &'a str,
    ) -> BoxFuture<'a, BackendResult<CapacityResource>> {
        Box::pin(async move {
            self.state
                .get_mut()
                .capacities
                .get(stack_name)
                .map(|(resource, _)| resource.clone())
                .ok_or_else(|| BackendError::NotFound(stack_name.to_string()))
        })
    }

    fn describe_capacity<'a>(
        &'a self,
        resource: &'a CapacityResource,
    ) -> BoxFuture<'a, BackendResult<FleetCapacity>> {
        Box::pin(async move {
            self.state
                .get_mut()
                .capacities
                .values()
                .find(|(r, _)| r == resource)
                .map(|(_, capacity)| capacity.clone())
                .ok_or_else(|| BackendError::NotFound(resource.to_string()))
        })
    }

    fn modify_target_capacity<'a>(
        &'a self,
        resource: &'a CapacityResource,
        target_capacity: u32,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            let (_, capacity) = state
                .capacities
                .values_mut()
                .find(|(r, _)| r == resource)
                .ok_or_else(|| BackendError::NotFound(resource.to_string()))?;
            capacity.target_capacity = target_capacity;
            state.capacity_updates.push(target_capacity);
            Ok(())
        })
    }

    fn delete_stack<'a>(&'a self, stack_name: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let mut state = self.state.get_mut();
            state.deleted_stacks.push(stack_name.to_string());
            state.capacities.remove(stack_name);
            match state.stacks.remove(stack_name) {
                Some(_) => Ok(()),
                None => Err(BackendError::NotFound(stack_name.to_string())),
            }
        })
    }

    fn dry_run<'a>(
        &'a self,
        instance_type: &'a str,
        _params: &'a JobParams,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            match self.state.get_mut().dry_run_failures.get(instance_type) {
                Some(message) => Err(anyhow!("{message}").into()),
                None => Ok(()),
            }
        })
    }

    fn describe_instance_types<'a>(
        &'a self,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, BackendResult<Vec<InstanceTypeOption>>> {
        Box::pin(async move {
            Ok(instance_types
                .iter()
                .map(|name| InstanceTypeOption {
                    name: name.clone(),
                    weighted_capacity: 1,
                    default_vcpus: 2,
                })
                .collect())
        })
    }
}

#[derive(Default)]
struct ChecksState {
    budgets: BTreeMap<String, BudgetStatus>,
    quotas: Map<(QuotaKind, String), QuotaInfo>,
    reservations: Vec<ReservationUsage>,
    licenses: BTreeMap<String, u32>,
}

/// Admission checks that allow everything unless configured otherwise.
#[derive(Default)]
pub struct MockChecks {
    state: WrappedArcMutex<ChecksState>,
}

impl MockChecks {
    pub fn set_budget(&self, project: &str, budget: BudgetStatus) {
        self.state
            .get_mut()
            .budgets
            .insert(project.to_string(), budget);
    }

    pub fn set_quota(&self, kind: QuotaKind, instance_type: &str, quota: QuotaInfo) {
        self.state
            .get_mut()
            .quotas
            .insert((kind, instance_type.to_string()), quota);
    }

    pub fn set_reservations(&self, reservations: Vec<ReservationUsage>) {
        self.state.get_mut().reservations = reservations;
    }

    pub fn set_licenses(&self, license: &str, count: u32) {
        self.state
            .get_mut()
            .licenses
            .insert(license.to_string(), count);
    }
}

impl BudgetChecker for MockChecks {
    fn get_budget<'a>(
        &'a self,
        project: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<BudgetStatus>>> {
        Box::pin(async move { Ok(self.state.get_mut().budgets.get(project).cloned()) })
    }
}

impl QuotaChecker for MockChecks {
    fn get_quota<'a>(
        &'a self,
        kind: QuotaKind,
        instance_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<QuotaInfo>> {
        Box::pin(async move {
            let quota = self
                .state
                .get_mut()
                .quotas
                .get(&(kind, instance_type.to_string()))
                .cloned()
                .unwrap_or(QuotaInfo {
                    quota_name: format!("{kind:?}"),
                    limit_vcpus: 1000,
                    used_vcpus: 0,
                });
            Ok(quota)
        })
    }
}

impl ReservationSource for MockChecks {
    fn get_reservations<'a>(
        &'a self,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<Vec<ReservationUsage>>> {
        Box::pin(async move {
            Ok(self
                .state
                .get_mut()
                .reservations
                .iter()
                .filter(|r| instance_types.contains(&r.instance_type))
                .cloned()
                .collect())
        })
    }
}

impl LicenseChecker for MockChecks {
    fn available_licenses<'a>(&'a self, license: &'a str) -> BoxFuture<'a, anyhow::Result<u32>> {
        Box::pin(async move {
            self.state
                .get_mut()
                .licenses
                .get(license)
                .copied()
                .ok_or_else(|| anyhow!("Unknown license {license}"))
        })
    }
}

/// Remembers the jobs it was notified about.
#[derive(Default)]
pub struct MockNotifier {
    started: WrappedArcMutex<Vec<Job>>,
}

impl MockNotifier {
    pub fn started(&self) -> Vec<Job> {
        self.started.get_mut().clone()
    }
}

impl JobNotifier for MockNotifier {
    fn job_started(&self, job: &Job) {
        self.started.get_mut().push(job.clone());
    }
}

pub struct TestEnv {
    pub ctx: SchedulerContext,
    pub scheduler: Arc<MockScheduler>,
    pub backend: Arc<MockBackend>,
    pub checks: Arc<MockChecks>,
    pub notifier: Arc<MockNotifier>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Environment with a ready job cache.
    pub fn with_config(config: SchedulerConfig) -> Self {
        init_logging();
        let scheduler = Arc::new(MockScheduler::default());
        let backend = Arc::new(MockBackend::default());
        let checks = Arc::new(MockChecks::default());
        let admission = AdmissionChecks {
            budgets: checks.clone(),
            quotas: checks.clone(),
            reservations: checks.clone(),
            reservation_policy: Arc::new(UnscopedReservationPolicy),
            licenses: checks.clone(),
        };
        let notifier = Arc::new(MockNotifier::default());
        let ctx = SchedulerContext::new(config, scheduler.clone(), backend.clone(), admission)
            .with_notifier(notifier.clone());
        ctx.job_cache.set_ready(true);
        Self {
            ctx,
            scheduler,
            backend,
            checks,
            notifier,
        }
    }

    /// Registers jobs in the scheduler and in the job cache.
    pub fn add_jobs(&self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            self.scheduler.add_job(job.clone());
            self.ctx.job_cache.sync([job]);
        }
    }
}
