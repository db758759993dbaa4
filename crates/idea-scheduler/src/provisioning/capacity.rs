//! Sizing of the target capacity of a job group stack.
use crate::job::{Job, JobId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPlan {
    pub target_capacity: u32,
    /// Jobs covered by the target capacity.
    pub covered: Vec<JobId>,
    /// Jobs that do not fit under the capacity limit.
    pub uncovered: Vec<JobId>,
}

impl CapacityPlan {
    pub fn is_partial(&self) -> bool {
        !self.covered.is_empty() && !self.uncovered.is_empty()
    }
}

/// Computes how much capacity a batch of jobs needs on top of the existing capacity.
///
/// Idle capacity (target capacity not used by provisioned jobs) is consumed first. The target
/// never grows above `max_capacity`, jobs that do not fit are reported as uncovered.
pub struct BatchCapacityHelper {
    current_target: u32,
    used_capacity: u32,
    max_capacity: Option<u32>,
}

impl BatchCapacityHelper {
    pub fn new(current_target: u32, used_capacity: u32, max_capacity: Option<u32>) -> Self {
        Self {
            current_target,
            used_capacity,
            max_capacity,
        }
    }

    pub fn plan<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> CapacityPlan {
        let mut idle = self.current_target.saturating_sub(self.used_capacity);
        let mut target = self.current_target;
        let mut covered = vec![];
        let mut uncovered = vec![];
        for job in jobs {
            let needed = job.desired_capacity();
            if idle >= needed {
                idle -= needed;
                covered.push(job.job_id.clone());
                continue;
            }
            let missing = needed - idle;
            if self
                .max_capacity
                .is_some_and(|max| target.saturating_add(missing) > max)
            {
                uncovered.push(job.job_id.clone());
                continue;
            }
            target += missing;
            idle = 0;
            covered.push(job.job_id.clone());
        }
        CapacityPlan {
            target_capacity: target,
            covered,
            uncovered,
        }
    }
}
