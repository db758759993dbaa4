use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = String;

/// Id of a job that was not yet accepted by the scheduler.
pub const UNASSIGNED_JOB_ID: &str = "tbd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Transit,
    Queued,
    Held,
    Waiting,
    Running,
    Exiting,
    Suspended,
    UserSuspended,
    Begun,
    Moved,
    Expired,
    SubjobFinished,
    Finished,
}

impl JobState {
    /// Decodes the single letter state used by PBS (`job_state` attribute).
    pub fn from_pbs_code(code: &str) -> Option<JobState> {
        let state = match code {
            "T" => JobState::Transit,
            "Q" => JobState::Queued,
            "H" => JobState::Held,
            "W" => JobState::Waiting,
            "R" => JobState::Running,
            "E" => JobState::Exiting,
            "S" => JobState::Suspended,
            "U" => JobState::UserSuspended,
            "B" => JobState::Begun,
            "M" => JobState::Moved,
            "X" => JobState::SubjobFinished,
            "F" => JobState::Finished,
            _ => return None,
        };
        Some(state)
    }

    pub fn pbs_code(&self) -> &'static str {
        match self {
            JobState::Transit => "T",
            JobState::Queued => "Q",
            JobState::Held => "H",
            JobState::Waiting => "W",
            JobState::Running => "R",
            JobState::Exiting => "E",
            JobState::Suspended => "S",
            JobState::UserSuspended => "U",
            JobState::Begun => "B",
            JobState::Moved => "M",
            JobState::Expired => "X",
            JobState::SubjobFinished => "X",
            JobState::Finished => "F",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Expired | JobState::SubjobFinished | JobState::Moved
        )
    }

    pub fn is_queued_or_held(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Held)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::Begun | JobState::Exiting
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Transit => "TRANSIT",
            JobState::Queued => "QUEUED",
            JobState::Held => "HELD",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Exiting => "EXITING",
            JobState::Suspended => "SUSPENDED",
            JobState::UserSuspended => "USER_SUSPENDED",
            JobState::Begun => "BEGUN",
            JobState::Moved => "MOVED",
            JobState::Expired => "EXPIRED",
            JobState::SubjobFinished => "SUBJOB_FINISHED",
            JobState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingMode {
    SingleJob,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    OnDemand,
    Spot,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LicenseRequest {
    pub name: String,
    pub count: u32,
}

/// Resources and provisioning hints of a job.
///
/// Values come from the job request, missing ones are filled from the default job parameters
/// of the owning queue profile. Scheduler specific values without a dedicated field
/// (e.g. the raw `select` expression) are kept in `custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParams {
    pub nodes: u32,
    pub cpus: u32,
    pub memory: Option<String>,
    pub instance_types: Vec<String>,
    pub base_os: Option<String>,
    pub instance_ami: Option<String>,
    /// `"auto"` or a maximum price, presence means spot capacity.
    pub spot_price: Option<String>,
    /// Number of spot instances in a mixed on-demand/spot fleet.
    pub spot_allocation_count: Option<u32>,
    pub spot_allocation_strategy: Option<String>,
    pub placement_group: Option<bool>,
    pub keep_forever: Option<bool>,
    pub terminate_when_idle: Option<u32>,
    pub job_group: Option<String>,
    pub force_reserved_instances: bool,
    pub licenses: Vec<LicenseRequest>,
    pub custom: BTreeMap<String, String>,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            nodes: 1,
            cpus: 1,
            memory: None,
            instance_types: vec![],
            base_os: None,
            instance_ami: None,
            spot_price: None,
            spot_allocation_count: None,
            spot_allocation_strategy: None,
            placement_group: None,
            keep_forever: None,
            terminate_when_idle: None,
            job_group: None,
            force_reserved_instances: false,
            licenses: vec![],
            custom: Default::default(),
        }
    }
}

impl JobParams {
    pub fn capacity_type(&self) -> CapacityType {
        match (&self.spot_price, self.spot_allocation_count) {
            (None, _) => CapacityType::OnDemand,
            (Some(_), Some(count)) if count < self.nodes => CapacityType::Mixed,
            (Some(_), _) => CapacityType::Spot,
        }
    }

    /// Fills values that were not requested by the job from `defaults`.
    pub fn apply_defaults(&mut self, defaults: &JobParams) {
        fn fill<T: Clone>(value: &mut Option<T>, default: &Option<T>) {
            if value.is_none() {
                value.clone_from(default);
            }
        }

        if self.instance_types.is_empty() {
            self.instance_types.clone_from(&defaults.instance_types);
        }
        fill(&mut self.memory, &defaults.memory);
        fill(&mut self.base_os, &defaults.base_os);
        fill(&mut self.instance_ami, &defaults.instance_ami);
        fill(&mut self.spot_price, &defaults.spot_price);
        fill(
            &mut self.spot_allocation_count,
            &defaults.spot_allocation_count,
        );
        fill(
            &mut self.spot_allocation_strategy,
            &defaults.spot_allocation_strategy,
        );
        fill(&mut self.placement_group, &defaults.placement_group);
        fill(&mut self.keep_forever, &defaults.keep_forever);
        fill(&mut self.terminate_when_idle, &defaults.terminate_when_idle);
        fill(&mut self.job_group, &defaults.job_group);
        self.force_reserved_instances |= defaults.force_reserved_instances;
        for (key, value) in &defaults.custom {
            self.custom
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Canonical description of the compute shape requested by the job.
    ///
    /// Jobs with the same shape can share one capacity stack.
    pub fn shape_key(&self) -> String {
        let mut key = format!(
            "instance_types={};base_os={};ami={};spot_price={};spot_count={};placement_group={};memory={}",
            self.instance_types.join("+"),
            self.base_os.as_deref().unwrap_or_default(),
            self.instance_ami.as_deref().unwrap_or_default(),
            self.spot_price.as_deref().unwrap_or_default(),
            self.spot_allocation_count
                .map(|c| c.to_string())
                .unwrap_or_default(),
            self.placement_group.unwrap_or(false),
            self.memory.as_deref().unwrap_or_default(),
        );
        // BTreeMap keeps the custom values ordered
        for (name, value) in &self.custom {
            key.push_str(&format!(";{name}={value}"));
        }
        key
    }

    pub fn license_count(&self, name: &str) -> u32 {
        self.licenses
            .iter()
            .filter(|l| l.name == name)
            .map(|l| l.count)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeOption {
    pub name: String,
    pub weighted_capacity: u32,
    pub default_vcpus: u32,
}

/// Instance type details resolved from the provisioning backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningOptions {
    pub instance_types: Vec<InstanceTypeOption>,
}

impl ProvisioningOptions {
    pub fn get(&self, instance_type: &str) -> Option<&InstanceTypeOption> {
        self.instance_types.iter().find(|t| t.name == instance_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionHost {
    pub host: String,
    pub instance_id: Option<String>,
    pub instance_type: Option<String>,
    pub execution_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Identifier assigned at submission time, stable across scheduler retries.
    pub job_uid: String,
    pub name: String,
    pub owner: String,
    pub project: Option<String>,
    pub queue: String,
    /// Name of the owning queue profile.
    pub queue_type: Option<String>,
    pub scaling_mode: Option<ScalingMode>,
    pub state: JobState,
    pub params: JobParams,
    pub provisioning_options: Option<ProvisioningOptions>,
    pub job_group: Option<String>,
    pub provisioned: bool,
    pub stack_id: Option<String>,
    pub queue_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub provisioning_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_hosts: Vec<JobExecutionHost>,
}

impl Job {
    pub fn new(job_id: JobId, queue: String, owner: String, state: JobState) -> Self {
        Self {
            job_uid: job_id.clone(),
            job_id,
            name: String::new(),
            owner,
            project: None,
            queue,
            queue_type: None,
            scaling_mode: None,
            state,
            params: Default::default(),
            provisioning_options: None,
            job_group: None,
            provisioned: false,
            stack_id: None,
            queue_time: None,
            start_time: None,
            provisioning_time: None,
            end_time: None,
            execution_hosts: vec![],
        }
    }

    pub fn log_tag(&self) -> String {
        if self.name.is_empty() {
            format!("[{}]", self.job_id)
        } else {
            format!("[{} ({})]", self.job_id, self.name)
        }
    }

    pub fn desired_nodes(&self) -> u32 {
        self.params.nodes.max(1)
    }

    /// Capacity units needed by the job: nodes weighted by the capacity of the primary
    /// instance type.
    pub fn desired_capacity(&self) -> u32 {
        self.desired_nodes() * self.primary_weighted_capacity()
    }

    pub fn primary_weighted_capacity(&self) -> u32 {
        self.params
            .instance_types
            .first()
            .and_then(|name| {
                self.provisioning_options
                    .as_ref()
                    .and_then(|options| options.get(name))
            })
            .map(|option| option.weighted_capacity.max(1))
            .unwrap_or(1)
    }

    /// vCPUs requested across all nodes, used for service quota checks.
    pub fn requested_vcpus(&self) -> u32 {
        let vcpus_per_node = self
            .params
            .instance_types
            .first()
            .and_then(|name| {
                self.provisioning_options
                    .as_ref()
                    .and_then(|options| options.get(name))
            })
            .map(|option| option.default_vcpus)
            .unwrap_or(self.params.cpus);
        self.desired_nodes() * vcpus_per_node
    }

    pub fn is_queued(&self) -> bool {
        self.state == JobState::Queued
    }

    pub fn is_provisioning_candidate(&self) -> bool {
        self.is_queued() && !self.provisioned
    }

    pub fn is_keep_forever(&self) -> bool {
        self.params.keep_forever.unwrap_or(false)
    }

    /// Numeric part of the scheduler id (`"123.server"` -> 123).
    pub fn id_sequence(&self) -> u64 {
        let digits: String = self
            .job_id
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().unwrap_or(0)
    }

    pub fn queue_timestamp(&self) -> f64 {
        self.queue_time
            .map(crate::common::timeutils::unix_seconds)
            .unwrap_or(0.0)
    }

    pub fn first_execution_host(&self) -> Option<&JobExecutionHost> {
        self.execution_hosts.first()
    }
}
