//! Management of queue profiles and of the provisioning pipelines of enabled profiles.
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};

use crate::cache::JobFilter;
use crate::common::error::IdeaError;
use crate::common::utils::generate_id;
use crate::common::{Map, WrappedArcMutex};
use crate::context::SchedulerContext;
use crate::get_or_return;
use crate::job::JobState;
use crate::profiles::cache::{ProfileCache, ProfileCacheKey};
use crate::profiles::store::QueueProfileStore;
use crate::provisioning::{JobProvisioner, ProvisioningQueue, QueueStatus};
use crate::queue_profile::{QueueProfile, QueueProfileId};
use crate::scheduler::QueueCreation;

/// Identifies a queue profile either by its id or by its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileKey {
    Id(QueueProfileId),
    Name(String),
}

impl ProfileKey {
    pub fn id(id: &str) -> Self {
        Self::Id(id.to_string())
    }

    pub fn name(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl Display for ProfileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKey::Id(id) => write!(f, "id {id}"),
            ProfileKey::Name(name) => write!(f, "name {name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueProfileWithStatus {
    pub profile: QueueProfile,
    /// Present only for enabled profiles.
    pub status: Option<QueueStatus>,
}

struct LiveProfile {
    queue: Arc<ProvisioningQueue>,
    provisioner: JobProvisioner,
}

type LiveProfiles = Map<QueueProfileId, LiveProfile>;

pub struct QueueProfileRegistry {
    ctx: SchedulerContext,
    store: Arc<dyn QueueProfileStore>,
    cache: ProfileCache,
    /// Serializes every change of the set of running provisioners.
    live: Mutex<LiveProfiles>,
    /// Queues of enabled profiles by profile name, readable without awaiting `live`.
    queues: WrappedArcMutex<Map<String, Arc<ProvisioningQueue>>>,
}

impl QueueProfileRegistry {
    pub fn new(ctx: SchedulerContext, store: Arc<dyn QueueProfileStore>) -> Self {
        let cache = ProfileCache::new(
            ctx.config.profile_cache.capacity,
            ctx.config.profile_cache.ttl,
        );
        Self {
            ctx,
            store,
            cache,
            live: Default::default(),
            queues: Default::default(),
        }
    }

    pub async fn create(&self, mut profile: QueueProfile) -> crate::Result<QueueProfile> {
        profile.validate()?;
        if self.store.get_by_name(&profile.name).await?.is_some() {
            return Err(IdeaError::AlreadyExists(format!(
                "queue profile with name {}",
                profile.name
            )));
        }

        profile.queue_profile_id = generate_id(8);
        profile.enabled = false;
        if profile.keep_forever && profile.stack_uuid.is_none() {
            profile.stack_uuid = Some(generate_id(8));
        }
        let now = Utc::now();
        profile.created_on = Some(now);
        profile.updated_on = Some(now);

        self.store.create(profile.clone()).await?;
        self.cache.clear();
        self.create_queues(&profile.queues).await?;
        log::info!(
            "Queue profile {} ({}) created with queues {:?}",
            profile.name,
            profile.queue_profile_id,
            profile.queues
        );
        self.cache.insert_profile(&profile);
        Ok(profile)
    }

    /// Replaces a stored profile. The enabled flag and the creation time are kept, queues that
    /// were added are created in the scheduler and queues that were removed are deleted.
    pub async fn update(&self, mut profile: QueueProfile) -> crate::Result<QueueProfile> {
        profile.validate()?;
        let mut live = self.live.lock().await;

        let key = if profile.queue_profile_id.is_empty() {
            ProfileKey::Name(profile.name.clone())
        } else {
            ProfileKey::Id(profile.queue_profile_id.clone())
        };
        let existing = self.load(&key).await?;
        if existing.name != profile.name && self.store.get_by_name(&profile.name).await?.is_some()
        {
            return Err(IdeaError::AlreadyExists(format!(
                "queue profile with name {}",
                profile.name
            )));
        }

        profile.queue_profile_id = existing.queue_profile_id.clone();
        profile.enabled = existing.enabled;
        profile.created_on = existing.created_on;
        profile.updated_on = Some(Utc::now());
        if profile.keep_forever && profile.stack_uuid.is_none() {
            profile.stack_uuid = existing
                .stack_uuid
                .clone()
                .or_else(|| Some(generate_id(8)));
        }

        self.store.update(profile.clone()).await?;
        self.cache.clear();

        let added: Vec<String> = profile
            .queues
            .iter()
            .filter(|q| !existing.owns_queue(q))
            .cloned()
            .collect();
        let removed: Vec<String> = existing
            .queues
            .iter()
            .filter(|q| !profile.owns_queue(q))
            .cloned()
            .collect();
        self.create_queues(&added).await?;
        self.delete_queues(&removed).await;

        // Jobs waiting in the queue survive the restart of the provisioner
        if let Some(queue) = live.get(&profile.queue_profile_id).map(|p| p.queue.clone()) {
            self.stop_provisioner_locked(&mut live, &profile.queue_profile_id)
                .await;
            queue.update_profile(profile.clone());
            self.start_provisioner_locked(&mut live, &profile, Some(queue));
        }
        log::info!(
            "Queue profile {} ({}) updated",
            profile.name,
            profile.queue_profile_id
        );
        Ok(profile)
    }

    /// Enables a profile and starts its provisioner. Enabling an enabled profile does nothing.
    pub async fn enable(&self, key: &ProfileKey) -> crate::Result<QueueProfile> {
        let mut live = self.live.lock().await;
        let mut profile = self.load(key).await?;
        if !profile.enabled {
            profile.enabled = true;
            profile.updated_on = Some(Utc::now());
            self.store.update(profile.clone()).await?;
            self.cache.clear();
            log::info!("Queue profile {} enabled", profile.name);
        }
        if !live.contains_key(&profile.queue_profile_id) {
            self.start_provisioner_locked(&mut live, &profile, None);
        }
        Ok(profile)
    }

    /// Disables a profile and stops its provisioner. Disabling a disabled profile does nothing.
    pub async fn disable(&self, key: &ProfileKey) -> crate::Result<QueueProfile> {
        let mut live = self.live.lock().await;
        let mut profile = self.load(key).await?;
        if profile.enabled {
            profile.enabled = false;
            profile.updated_on = Some(Utc::now());
            self.store.update(profile.clone()).await?;
            self.cache.clear();
            log::info!("Queue profile {} disabled", profile.name);
        }
        self.stop_provisioner_locked(&mut live, &profile.queue_profile_id)
            .await;
        Ok(profile)
    }

    /// Removes a profile. Scheduler queues are deleted on a best-effort basis.
    pub async fn delete(&self, key: &ProfileKey, delete_queues: bool) -> crate::Result<()> {
        let mut live = self.live.lock().await;
        let profile = self.load(key).await?;
        self.stop_provisioner_locked(&mut live, &profile.queue_profile_id)
            .await;
        if delete_queues {
            self.delete_queues(&profile.queues).await;
        }
        self.cache.clear();
        self.store.delete(&profile.queue_profile_id).await?;
        log::info!(
            "Queue profile {} ({}) deleted",
            profile.name,
            profile.queue_profile_id
        );
        Ok(())
    }

    pub async fn get(&self, key: &ProfileKey) -> crate::Result<QueueProfile> {
        let cache_key = match key {
            ProfileKey::Id(id) => ProfileCacheKey::Id(id.clone()),
            ProfileKey::Name(name) => ProfileCacheKey::Name(name.clone()),
        };
        if let Some(profile) = self.cache.get(&cache_key) {
            return Ok(profile);
        }
        let profile = self.load(key).await?;
        self.cache.insert_profile(&profile);
        Ok(profile)
    }

    /// Profile that owns the given scheduler queue.
    pub async fn get_by_queue_name(&self, queue: &str) -> crate::Result<Option<QueueProfile>> {
        let cache_key = ProfileCacheKey::Queue(queue.to_string());
        if let Some(profile) = self.cache.get(&cache_key) {
            return Ok(Some(profile));
        }
        let profile = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|p| p.owns_queue(queue));
        if let Some(profile) = &profile {
            self.cache.insert(cache_key, profile.clone());
        }
        Ok(profile)
    }

    /// All profiles ordered by name.
    pub async fn list(&self) -> crate::Result<Vec<QueueProfile>> {
        let mut profiles = self.store.list().await?;
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    pub async fn list_enabled(&self) -> crate::Result<Vec<QueueProfile>> {
        let mut profiles = self.list().await?;
        profiles.retain(|p| p.enabled);
        Ok(profiles)
    }

    pub async fn list_with_status(&self) -> crate::Result<Vec<QueueProfileWithStatus>> {
        let profiles = self.list().await?;
        Ok(profiles
            .into_iter()
            .map(|profile| {
                let status = self
                    .get_provisioning_queue(&profile.name)
                    .map(|queue| queue.status());
                QueueProfileWithStatus { profile, status }
            })
            .collect())
    }

    /// Queue of an enabled profile.
    pub fn get_provisioning_queue(&self, profile_name: &str) -> Option<Arc<ProvisioningQueue>> {
        self.queues.get_mut().get(profile_name).cloned()
    }

    /// Queue of the enabled profile that owns the scheduler queue `queue`.
    pub fn provisioning_queue_for(&self, queue: &str) -> Option<Arc<ProvisioningQueue>> {
        self.queues
            .get_mut()
            .values()
            .find(|q| q.profile().owns_queue(queue))
            .cloned()
    }

    pub fn provisioning_queues(&self) -> Vec<Arc<ProvisioningQueue>> {
        self.queues.get_mut().values().cloned().collect()
    }

    pub async fn is_running(&self, key: &ProfileKey) -> crate::Result<bool> {
        let profile = self.get(key).await?;
        let live = self.live.lock().await;
        Ok(live
            .get(&profile.queue_profile_id)
            .is_some_and(|p| p.provisioner.is_running()))
    }

    /// Loads persisted profiles, makes sure their scheduler queues exist and starts the
    /// provisioners of enabled profiles. Profiles from the configuration are created first
    /// when the store is empty.
    pub async fn start(&self) -> crate::Result<()> {
        if self.store.list().await?.is_empty() {
            for seed in self.ctx.config.queue_profiles.clone() {
                let enabled = seed.enabled;
                let profile = self.create(seed).await?;
                if enabled {
                    self.enable(&ProfileKey::Id(profile.queue_profile_id)).await?;
                }
            }
        }

        let profiles = self.list().await?;
        let mut live = self.live.lock().await;
        for profile in profiles {
            if let Err(error) = self.create_queues(&profile.queues).await {
                log::error!(
                    "Cannot create queues of queue profile {}: {error:?}",
                    profile.name
                );
            }
            if profile.enabled && !live.contains_key(&profile.queue_profile_id) {
                self.start_provisioner_locked(&mut live, &profile, None);
            }
        }
        log::info!(
            "Queue profile registry started, {} profile(s) enabled",
            live.len()
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let mut live = self.live.lock().await;
        let ids: Vec<QueueProfileId> = live.keys().cloned().collect();
        for id in ids {
            self.stop_provisioner_locked(&mut live, &id).await;
        }
    }

    async fn load(&self, key: &ProfileKey) -> crate::Result<QueueProfile> {
        let profile = match key {
            ProfileKey::Id(id) => self.store.get(id).await?,
            ProfileKey::Name(name) => self.store.get_by_name(name).await?,
        };
        profile.ok_or_else(|| IdeaError::NotFound(format!("queue profile with {key}")))
    }

    async fn create_queues(&self, queues: &[String]) -> crate::Result<()> {
        for queue in queues {
            match self.ctx.scheduler.create_queue(queue).await {
                Ok(QueueCreation::Created) => log::info!("Scheduler queue {queue} created"),
                Ok(QueueCreation::AlreadyExists) => {
                    log::debug!("Scheduler queue {queue} already exists")
                }
                Err(error) => {
                    return Err(IdeaError::GenericError(format!(
                        "Cannot create scheduler queue {queue}: {error:#}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn delete_queues(&self, queues: &[String]) {
        for queue in queues {
            match self.ctx.scheduler.delete_queue(queue).await {
                Ok(()) => log::info!("Scheduler queue {queue} deleted"),
                Err(error) => log::warn!("Cannot delete scheduler queue {queue}: {error:?}"),
            }
        }
    }

    fn start_provisioner_locked(
        &self,
        live: &mut MutexGuard<'_, LiveProfiles>,
        profile: &QueueProfile,
        queue: Option<Arc<ProvisioningQueue>>,
    ) {
        let queue = queue
            .unwrap_or_else(|| Arc::new(ProvisioningQueue::new(self.ctx.clone(), profile.clone())));
        self.queues
            .get_mut()
            .insert(profile.name.clone(), queue.clone());

        let mut added = 0;
        for queue_name in &profile.queues {
            let jobs = self.ctx.job_cache.list_jobs(&JobFilter {
                queue: Some(queue_name.clone()),
                states: vec![JobState::Queued],
                provisioned: Some(false),
                ..Default::default()
            });
            for job in jobs {
                if queue.put(&job, false) {
                    added += 1;
                }
            }
        }
        if added > 0 {
            log::debug!(
                "{added} cached job(s) added to queue of profile {}",
                profile.name
            );
        }

        let mut provisioner = JobProvisioner::new(self.ctx.clone(), queue.clone());
        provisioner.start();
        live.insert(
            profile.queue_profile_id.clone(),
            LiveProfile { queue, provisioner },
        );
    }

    async fn stop_provisioner_locked(
        &self,
        live: &mut MutexGuard<'_, LiveProfiles>,
        queue_profile_id: &str,
    ) {
        let mut profile = get_or_return!(live.remove(queue_profile_id));
        profile.provisioner.stop().await;
        let is_same = |q: &Arc<ProvisioningQueue>| Arc::ptr_eq(q, &profile.queue);
        self.queues.get_mut().retain(|_, q| !is_same(q));
    }
}
