//! Admission check collaborators consulted before capacity is requested.
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget_name: String,
    pub limit: f64,
    pub actual_spend: f64,
}

impl BudgetStatus {
    pub fn is_exceeded(&self) -> bool {
        self.actual_spend >= self.limit
    }
}

pub trait BudgetChecker: Send + Sync {
    /// Budget attached to a project, `None` when the project has no budget.
    fn get_budget<'a>(
        &'a self,
        project: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<BudgetStatus>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaKind {
    OnDemand,
    Spot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub quota_name: String,
    pub limit_vcpus: u32,
    pub used_vcpus: u32,
}

impl QuotaInfo {
    pub fn available_vcpus(&self) -> u32 {
        self.limit_vcpus.saturating_sub(self.used_vcpus)
    }
}

pub trait QuotaChecker: Send + Sync {
    fn get_quota<'a>(
        &'a self,
        kind: QuotaKind,
        instance_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<QuotaInfo>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationUsage {
    pub instance_type: String,
    pub purchased: u32,
    pub running: u32,
}

/// Capacity that has to be covered by reserved instances of one instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationDemand {
    pub instance_type: String,
    pub weighted_capacity: u32,
    pub desired_capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationShortfall {
    pub instance_type: String,
    pub purchased: u32,
    pub running: u32,
    pub needed: u32,
}

impl ReservationShortfall {
    pub fn missing(&self) -> u32 {
        self.needed.saturating_sub(self.purchased)
    }
}

pub trait ReservationSource: Send + Sync {
    fn get_reservations<'a>(
        &'a self,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<Vec<ReservationUsage>>>;
}

/// Decides whether purchased reservations cover the demand of a job.
pub trait ReservationPolicy: Send + Sync {
    fn check(
        &self,
        usage: &[ReservationUsage],
        demand: &[ReservationDemand],
    ) -> Result<(), Vec<ReservationShortfall>>;
}

/// Compares the total purchased reservations of an instance type with its running instances.
///
/// Reservations are not matched by scope, tenancy or time window, so concurrent batches may
/// count the same reservation twice.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnscopedReservationPolicy;

impl ReservationPolicy for UnscopedReservationPolicy {
    fn check(
        &self,
        usage: &[ReservationUsage],
        demand: &[ReservationDemand],
    ) -> Result<(), Vec<ReservationShortfall>> {
        let shortfalls: Vec<ReservationShortfall> = demand
            .iter()
            .filter_map(|demand| {
                let (purchased, running) = usage
                    .iter()
                    .filter(|u| u.instance_type == demand.instance_type)
                    .fold((0, 0), |(p, r), u| (p + u.purchased, r + u.running));
                let weight = demand.weighted_capacity.max(1);
                let needed = running + demand.desired_capacity.div_ceil(weight);
                if purchased == 0 || purchased < needed {
                    Some(ReservationShortfall {
                        instance_type: demand.instance_type.clone(),
                        purchased,
                        running,
                        needed,
                    })
                } else {
                    None
                }
            })
            .collect();
        if shortfalls.is_empty() {
            Ok(())
        } else {
            Err(shortfalls)
        }
    }
}

pub trait LicenseChecker: Send + Sync {
    /// Total number of licenses of `license` (e.g. from a license server).
    fn available_licenses<'a>(&'a self, license: &'a str) -> BoxFuture<'a, anyhow::Result<u32>>;
}

/// Collaborators that back the admission checks.
#[derive(Clone)]
pub struct AdmissionChecks {
    pub budgets: Arc<dyn BudgetChecker>,
    pub quotas: Arc<dyn QuotaChecker>,
    pub reservations: Arc<dyn ReservationSource>,
    pub reservation_policy: Arc<dyn ReservationPolicy>,
    pub licenses: Arc<dyn LicenseChecker>,
}

impl AdmissionChecks {
    /// Checks that never reject a job, for clusters without budgets, quotas or licenses.
    pub fn unrestricted() -> Self {
        let checks = Arc::new(Unrestricted);
        Self {
            budgets: checks.clone(),
            quotas: checks.clone(),
            reservations: checks.clone(),
            reservation_policy: Arc::new(UnscopedReservationPolicy),
            licenses: checks,
        }
    }
}

struct Unrestricted;

impl BudgetChecker for Unrestricted {
    fn get_budget<'a>(
        &'a self,
        _project: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<BudgetStatus>>> {
        Box::pin(async { Ok(None) })
    }
}

impl QuotaChecker for Unrestricted {
    fn get_quota<'a>(
        &'a self,
        kind: QuotaKind,
        _instance_type: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<QuotaInfo>> {
        Box::pin(async move {
            Ok(QuotaInfo {
                quota_name: format!("{kind:?}"),
                limit_vcpus: u32::MAX,
                used_vcpus: 0,
            })
        })
    }
}

impl ReservationSource for Unrestricted {
    fn get_reservations<'a>(
        &'a self,
        _instance_types: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<Vec<ReservationUsage>>> {
        Box::pin(async { Ok(vec![]) })
    }
}

impl LicenseChecker for Unrestricted {
    fn available_licenses<'a>(&'a self, _license: &'a str) -> BoxFuture<'a, anyhow::Result<u32>> {
        Box::pin(async { Ok(u32::MAX) })
    }
}
