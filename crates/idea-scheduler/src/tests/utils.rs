use chrono::{DateTime, TimeZone, Utc};
use derive_builder::Builder;

use crate::backend::{StackInfo, StackStatus};
use crate::common::setup::build_logger;
use crate::job::{Job, JobState, LicenseRequest, ScalingMode};
use crate::queue_profile::{QueueMode, QueueProfile};

pub fn init_logging() {
    let _ = build_logger(true).is_test(true).try_init();
}

/// Timestamp `secs` seconds after the Unix epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct JobFixture {
    #[builder(setter(into))]
    id: String,
    #[builder(default, setter(into, strip_option))]
    uid: Option<String>,
    #[builder(default, setter(into))]
    name: String,
    #[builder(default = "\"alice\".to_string()", setter(into))]
    owner: String,
    #[builder(default, setter(into, strip_option))]
    project: Option<String>,
    #[builder(default = "\"normal\".to_string()", setter(into))]
    queue: String,
    #[builder(default, setter(into, strip_option))]
    queue_type: Option<String>,
    #[builder(default = "JobState::Queued")]
    state: JobState,
    #[builder(default = "1")]
    nodes: u32,
    #[builder(default = "1")]
    cpus: u32,
    #[builder(default = "vec![\"c5.large\".to_string()]")]
    instance_types: Vec<String>,
    /// Sets both the requested and the derived job group.
    #[builder(default, setter(into, strip_option))]
    job_group: Option<String>,
    #[builder(default)]
    provisioned: bool,
    #[builder(default = "Some(Utc::now())")]
    queue_time: Option<DateTime<Utc>>,
    #[builder(default)]
    licenses: Vec<LicenseRequest>,
    #[builder(default, setter(into, strip_option))]
    spot_price: Option<String>,
    #[builder(default, setter(strip_option))]
    spot_allocation_count: Option<u32>,
    #[builder(default)]
    force_reserved_instances: bool,
}

pub type JobBuilder = JobFixtureBuilder;

impl JobFixtureBuilder {
    pub fn build(self) -> Job {
        let JobFixture {
            id,
            uid,
            name,
            owner,
            project,
            queue,
            queue_type,
            state,
            nodes,
            cpus,
            instance_types,
            job_group,
            provisioned,
            queue_time,
            licenses,
            spot_price,
            spot_allocation_count,
            force_reserved_instances,
        } = self.finish().unwrap();

        let mut job = Job::new(id.clone(), queue, owner, state);
        job.job_uid = uid.unwrap_or_else(|| format!("uid-{id}"));
        job.name = name;
        job.project = project;
        job.queue_type = queue_type;
        job.params.nodes = nodes;
        job.params.cpus = cpus;
        job.params.instance_types = instance_types;
        job.params.job_group.clone_from(&job_group);
        job.params.licenses = licenses;
        job.params.spot_price = spot_price;
        job.params.spot_allocation_count = spot_allocation_count;
        job.params.force_reserved_instances = force_reserved_instances;
        job.job_group = job_group;
        job.provisioned = provisioned;
        job.queue_time = queue_time;
        if state.is_running() {
            job.start_time = queue_time;
        }
        job
    }
}

pub fn single_job_profile(name: &str, queues: &[&str]) -> QueueProfile {
    let mut profile = QueueProfile::new(name, queues);
    profile.queue_profile_id = format!("{name}-id");
    profile.queue_mode = Some(QueueMode::Fifo);
    profile.scaling_mode = Some(ScalingMode::SingleJob);
    profile.projects = vec!["default".to_string()];
    profile
}

pub fn batch_profile(name: &str, queues: &[&str], terminate_when_idle: u32) -> QueueProfile {
    let mut profile = single_job_profile(name, queues);
    profile.scaling_mode = Some(ScalingMode::Batch);
    profile.terminate_when_idle = terminate_when_idle;
    profile
}

pub fn stack_info(stack_name: &str, status: StackStatus, shared: bool) -> StackInfo {
    StackInfo {
        stack_name: stack_name.to_string(),
        stack_id: format!("{stack_name}-id"),
        status,
        creation_time: Utc::now(),
        is_shared_resource: shared,
        job_group: None,
        queue_profile: None,
        queues: vec![],
    }
}
