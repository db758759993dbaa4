//! Short-lived cache of queue profile lookups.
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::common::WrappedArcMutex;
use crate::common::timeutils::now_monotonic;
use crate::queue_profile::QueueProfile;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProfileCacheKey {
    Id(String),
    Name(String),
    Queue(String),
}

/// LRU cache whose entries expire `ttl` after insertion.
pub struct ProfileCache {
    entries: WrappedArcMutex<LruCache<ProfileCacheKey, (Instant, QueueProfile)>>,
    ttl: Duration,
}

impl ProfileCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: WrappedArcMutex::wrap(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &ProfileCacheKey) -> Option<QueueProfile> {
        let mut entries = self.entries.get_mut();
        let (inserted, profile) = entries.get(key)?;
        if now_monotonic().duration_since(*inserted) < self.ttl {
            return Some(profile.clone());
        }
        entries.pop(key);
        None
    }

    pub fn insert(&self, key: ProfileCacheKey, profile: QueueProfile) {
        self.entries.get_mut().put(key, (now_monotonic(), profile));
    }

    /// Caches a profile under its id and name.
    pub fn insert_profile(&self, profile: &QueueProfile) {
        self.insert(
            ProfileCacheKey::Id(profile.queue_profile_id.clone()),
            profile.clone(),
        );
        self.insert(ProfileCacheKey::Name(profile.name.clone()), profile.clone());
    }

    pub fn clear(&self) {
        self.entries.get_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.get_mut().len()
    }
}
