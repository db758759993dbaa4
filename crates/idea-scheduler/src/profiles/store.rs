use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::common::WrappedArcMutex;
use crate::common::error::IdeaError;
use crate::queue_profile::QueueProfile;

/// Persistence of queue profiles.
pub trait QueueProfileStore: Send + Sync {
    fn create(&self, profile: QueueProfile) -> BoxFuture<'_, crate::Result<()>>;

    fn update(&self, profile: QueueProfile) -> BoxFuture<'_, crate::Result<()>>;

    fn get<'a>(&'a self, queue_profile_id: &'a str)
    -> BoxFuture<'a, crate::Result<Option<QueueProfile>>>;

    fn get_by_name<'a>(&'a self, name: &'a str)
    -> BoxFuture<'a, crate::Result<Option<QueueProfile>>>;

    fn list(&self) -> BoxFuture<'_, crate::Result<Vec<QueueProfile>>>;

    fn delete<'a>(&'a self, queue_profile_id: &'a str) -> BoxFuture<'a, crate::Result<()>>;
}

#[derive(Default)]
pub struct InMemoryQueueProfileStore {
    profiles: WrappedArcMutex<BTreeMap<String, QueueProfile>>,
}

impl QueueProfileStore for InMemoryQueueProfileStore {
    fn create(&self, profile: QueueProfile) -> BoxFuture<'_, crate::Result<()>> {
        Box::pin(async move {
            let mut profiles = self.profiles.get_mut();
            if profiles.contains_key(&profile.queue_profile_id) {
                return Err(IdeaError::AlreadyExists(format!(
                    "queue profile {}",
                    profile.queue_profile_id
                )));
            }
            profiles.insert(profile.queue_profile_id.clone(), profile);
            Ok(())
        })
    }

    fn update(&self, profile: QueueProfile) -> BoxFuture<'_, crate::Result<()>> {
        Box::pin(async move {
            let mut profiles = self.profiles.get_mut();
            match profiles.get_mut(&profile.queue_profile_id) {
                Some(stored) => {
                    *stored = profile;
                    Ok(())
                }
                None => Err(IdeaError::NotFound(format!(
                    "queue profile {}",
                    profile.queue_profile_id
                ))),
            }
        })
    }

    fn get<'a>(
        &'a self,
        queue_profile_id: &'a str,
    ) -> BoxFuture<'a, crate::Result<Option<QueueProfile>>> {
        Box::pin(async move { Ok(self.profiles.get_mut().get(queue_profile_id).cloned()) })
    }

    fn get_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, crate::Result<Option<QueueProfile>>> {
        Box::pin(async move {
            Ok(self
                .profiles
                .get_mut()
                .values()
                .find(|p| p.name == name)
                .cloned())
        })
    }

    fn list(&self) -> BoxFuture<'_, crate::Result<Vec<QueueProfile>>> {
        Box::pin(async move { Ok(self.profiles.get_mut().values().cloned().collect()) })
    }

    fn delete<'a>(&'a self, queue_profile_id: &'a str) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            self.profiles.get_mut().remove(queue_profile_id);
            Ok(())
        })
    }
}
