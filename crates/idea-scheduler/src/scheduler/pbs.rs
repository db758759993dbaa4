//! OpenPBS implementation of [`BatchScheduler`] built on top of the PBS command line tools.
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::process::Command;

use crate::job::{Job, JobExecutionHost, JobId, JobParams, JobState, LicenseRequest};
use crate::scheduler::{
    BatchScheduler, COMPUTE_STACK_RESOURCE, JOB_GROUP_RESOURCE, ListJobsRequest, QueueCreation,
    SchedulerResult,
};

/// `qstat` fails with this message when asked about a job it does not know.
const UNKNOWN_JOB_ERROR: &str = "Unknown Job Id";
/// `qmgr` fails with this message when creating a queue that already exists.
const ALREADY_EXISTS_ERROR: &str = "Object already exists";
const DEFAULT_PROJECT: &str = "_pbs_project_default";

pub struct PbsScheduler {
    workdir: PathBuf,
    license_resources: Vec<String>,
}

impl PbsScheduler {
    pub fn new(workdir: PathBuf, license_resources: Vec<String>) -> Self {
        Self {
            workdir,
            license_resources,
        }
    }

    async fn run(&self, arguments: Vec<&str>) -> anyhow::Result<Output> {
        log::debug!("Running PBS command `{}`", arguments.join(" "));
        let program = arguments[0].to_string();
        let mut command = create_command(arguments, &self.workdir);
        command
            .output()
            .await
            .with_context(|| format!("{program} start failed"))
    }

    async fn run_checked(&self, arguments: Vec<&str>) -> anyhow::Result<Output> {
        let program = arguments[0].to_string();
        let output = self.run(arguments).await?;
        check_command_output(output).with_context(|| format!("{program} execution failed"))
    }

    async fn qstat(&self, job_ids: &[JobId]) -> anyhow::Result<Vec<Job>> {
        let mut arguments = vec!["qstat", "-f", "-F", "json"];
        if !job_ids.is_empty() {
            // -x will also display finished jobs
            arguments.push("-x");
            arguments.extend(job_ids.iter().map(|id| id.as_str()));
        }
        let output = self.run(arguments).await?;
        log::trace!(
            "PBS qstat output\nStdout\n{}Stderr\n{}",
            output.stdout.to_str_lossy(),
            output.stderr.to_str_lossy()
        );
        if !output.status.success() {
            let unknown_only = output.stdout.trim().is_empty()
                && output
                    .stderr
                    .lines()
                    .all(|line| line.trim().is_empty() || line.contains_str(UNKNOWN_JOB_ERROR));
            if unknown_only {
                return Ok(vec![]);
            }
            if output.stdout.trim().is_empty() {
                check_command_output(output).context("qstat execution failed")?;
                return Ok(vec![]);
            }
        }
        parse_qstat_output(&output.stdout, &self.license_resources)
    }

    async fn qmgr(&self, directive: String) -> anyhow::Result<Output> {
        self.run(vec!["qmgr", "-c", &directive]).await
    }
}

impl BatchScheduler for PbsScheduler {
    fn list_jobs(&self, request: ListJobsRequest) -> BoxFuture<'_, SchedulerResult<Vec<Job>>> {
        Box::pin(async move {
            let jobs = self.qstat(&request.job_ids).await?;
            let jobs = jobs.into_iter().filter(|job| request.matches(job));
            Ok(match request.max_jobs {
                Some(max) => jobs.take(max).collect(),
                None => jobs.collect(),
            })
        })
    }

    fn get_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, SchedulerResult<Option<Job>>> {
        Box::pin(async move {
            let jobs = self.qstat(&[job_id.to_string()]).await?;
            Ok(jobs.into_iter().find(|job| job.job_id == job_id))
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, SchedulerResult<()>> {
        Box::pin(async move {
            self.run_checked(vec!["qdel", job_id]).await?;
            Ok(())
        })
    }

    fn create_queue<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<QueueCreation>> {
        Box::pin(async move {
            let output = self
                .qmgr(format!("create queue {queue} queue_type=execution"))
                .await?;
            if !output.status.success() {
                if output.stderr.contains_str(ALREADY_EXISTS_ERROR) {
                    return Ok(QueueCreation::AlreadyExists);
                }
                check_command_output(output)
                    .with_context(|| format!("Cannot create queue {queue}"))?;
            }
            for attribute in ["enabled", "started"] {
                let output = self
                    .qmgr(format!("set queue {queue} {attribute} = True"))
                    .await?;
                check_command_output(output)
                    .with_context(|| format!("Cannot set {attribute} on queue {queue}"))?;
            }
            Ok(QueueCreation::Created)
        })
    }

    fn delete_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, SchedulerResult<()>> {
        Box::pin(async move {
            let output = self.qmgr(format!("delete queue {queue}")).await?;
            check_command_output(output).with_context(|| format!("Cannot delete queue {queue}"))?;
            Ok(())
        })
    }

    fn modify_job_resources<'a>(
        &'a self,
        job_id: &'a str,
        resources: Vec<(String, String)>,
    ) -> BoxFuture<'a, SchedulerResult<()>> {
        Box::pin(async move {
            if resources.is_empty() {
                return Ok(());
            }
            let resources: Vec<String> = resources
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            let mut arguments = vec!["qalter"];
            for resource in &resources {
                arguments.extend_from_slice(&["-l", resource]);
            }
            arguments.push(job_id);
            self.run_checked(arguments).await?;
            Ok(())
        })
    }

    fn provision_job<'a>(
        &'a self,
        job: &'a Job,
        stack_id: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<DateTime<Utc>>> {
        Box::pin(async move {
            let resource = format!("{COMPUTE_STACK_RESOURCE}={stack_id}");
            self.run_checked(vec!["qalter", "-l", &resource, &job.job_id])
                .await
                .with_context(|| format!("Cannot provision job {}", job.job_id))?;
            Ok(Utc::now())
        })
    }
}

pub fn create_command(arguments: Vec<&str>, workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

fn parse_qstat_output(stdout: &[u8], license_resources: &[String]) -> anyhow::Result<Vec<Job>> {
    let data: serde_json::Value =
        serde_json::from_slice(stdout).context("Cannot parse qstat JSON output")?;
    let Some(jobs) = data["Jobs"].as_object() else {
        return Ok(vec![]);
    };
    jobs.iter()
        .map(|(job_id, value)| {
            parse_pbs_job(job_id, value, license_resources)
                .with_context(|| format!("Cannot parse PBS job {job_id}"))
        })
        .collect()
}

/// PBS reports resources either as JSON strings or numbers.
fn json_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_job_params(
    resources: &serde_json::Map<String, serde_json::Value>,
    license_resources: &[String],
) -> anyhow::Result<(JobParams, Option<String>, Option<String>)> {
    let mut params = JobParams::default();
    let mut job_uid = None;
    let mut stack_id = None;
    for (name, value) in resources {
        let Some(value) = json_to_string(value) else {
            continue;
        };
        let parse_u32 = || {
            value
                .parse::<u32>()
                .with_context(|| format!("Invalid value `{value}` of resource {name}"))
        };
        match name.as_str() {
            "nodect" => params.nodes = parse_u32()?,
            "ncpus" => params.cpus = parse_u32()?,
            "mem" => params.memory = Some(value),
            "instance_type" => {
                params.instance_types = value.split('+').map(|t| t.to_string()).collect()
            }
            "base_os" => params.base_os = Some(value),
            "instance_ami" => params.instance_ami = Some(value),
            "spot_price" => params.spot_price = Some(value),
            "spot_allocation_count" => params.spot_allocation_count = Some(parse_u32()?),
            "spot_allocation_strategy" => params.spot_allocation_strategy = Some(value),
            "placement_group" => params.placement_group = Some(parse_bool(&value)),
            "keep_forever" => params.keep_forever = Some(parse_bool(&value)),
            "terminate_when_idle" => params.terminate_when_idle = Some(parse_u32()?),
            JOB_GROUP_RESOURCE => params.job_group = Some(value),
            "force_ri" => params.force_reserved_instances = parse_bool(&value),
            "job_uid" => job_uid = Some(value),
            COMPUTE_STACK_RESOURCE => stack_id = Some(value),
            name if license_resources.iter().any(|l| l == name) => {
                params.licenses.push(LicenseRequest {
                    name: name.to_string(),
                    count: parse_u32()?,
                })
            }
            name => {
                params.custom.insert(name.to_string(), value);
            }
        }
    }
    Ok((params, job_uid, stack_id))
}

/// Parses `exec_host` values such as `ip-10-0-0-5/0*2+ip-10-0-0-6/0*2`.
fn parse_exec_hosts(exec_host: &str) -> Vec<JobExecutionHost> {
    let mut hosts: Vec<JobExecutionHost> = vec![];
    for chunk in exec_host.split('+') {
        let host = chunk.split('/').next().unwrap_or_default().trim();
        if host.is_empty() || hosts.iter().any(|h| h.host == host) {
            continue;
        }
        hosts.push(JobExecutionHost {
            host: host.to_string(),
            instance_id: None,
            instance_type: None,
            execution_time: None,
        });
    }
    hosts
}

fn parse_pbs_job(
    job_id: &str,
    value: &serde_json::Value,
    license_resources: &[String],
) -> anyhow::Result<Job> {
    let state_code = value["job_state"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("JSON key job_state not found"))?;
    let state = JobState::from_pbs_code(state_code)
        .ok_or_else(|| anyhow::anyhow!("Unknown PBS job state {state_code}"))?;
    let queue = value["queue"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("JSON key queue not found"))?;
    let owner = value["Job_Owner"]
        .as_str()
        .map(|owner| owner.split('@').next().unwrap_or(owner))
        .unwrap_or_default();

    let mut job = Job::new(
        job_id.to_string(),
        queue.to_string(),
        owner.to_string(),
        state,
    );
    job.name = value["Job_Name"].as_str().unwrap_or_default().to_string();
    job.project = value["project"]
        .as_str()
        .filter(|p| *p != DEFAULT_PROJECT)
        .map(|p| p.to_string());

    if let Some(resources) = value["Resource_List"].as_object() {
        let (params, job_uid, stack_id) = parse_job_params(resources, license_resources)?;
        job.job_group.clone_from(&params.job_group);
        job.params = params;
        if let Some(uid) = job_uid {
            job.job_uid = uid;
        }
        job.provisioned = stack_id.is_some();
        job.stack_id = stack_id;
    }

    let parse_time = |key: &str| -> anyhow::Result<Option<DateTime<Utc>>> {
        value[key]
            .as_str()
            .map(crate::common::timeutils::parse_pbs_datetime)
            .transpose()
    };
    job.queue_time = parse_time("qtime")?;
    job.start_time = parse_time("stime")?;
    if state.is_finished() {
        job.end_time = parse_time("mtime")?;
    }
    if let Some(exec_host) = value["exec_host"].as_str() {
        job.execution_hosts = parse_exec_hosts(exec_host);
    }
    Ok(job)
}
