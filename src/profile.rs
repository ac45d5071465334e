//! Sender profile lookup with a per-view cache.

use crate::entity::{Profile, UserId};
use crate::error::SyncResult;
use crate::remote::ProfileDirectory;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type ProfileFetch = Shared<BoxFuture<'static, SyncResult<Profile>>>;

#[derive(Default)]
struct ResolverState {
    cache: HashMap<UserId, Profile>,
    in_flight: HashMap<UserId, ProfileFetch>,
}

/// Resolves user ids to profiles. Owns the cache; everything else only reads
/// through it.
///
/// Concurrent `resolve` calls for the same unseen user share one directory
/// fetch. Failures are not cached, so a later call tries again.
pub struct ProfileResolver {
    directory: Arc<dyn ProfileDirectory>,
    state: Mutex<ResolverState>,
}

impl ProfileResolver {
    pub fn new(directory: Arc<dyn ProfileDirectory>) -> Self {
        Self {
            directory,
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Cached profile, if any. Never waits on the directory.
    pub fn cached(&self, user: &UserId) -> Option<Profile> {
        let state = self.state.lock().unwrap();
        state.cache.get(user).cloned()
    }

    pub fn is_cached(&self, user: &UserId) -> bool {
        self.state.lock().unwrap().cache.contains_key(user)
    }

    pub async fn resolve(&self, user: &UserId) -> SyncResult<Profile> {
        let fetch = {
            let mut state = self.state.lock().unwrap();
            if let Some(profile) = state.cache.get(user) {
                return Ok(profile.clone());
            }
            match state.in_flight.get(user) {
                Some(fetch) => {
                    debug!(user_id = %user, "Joining in-flight profile lookup");
                    fetch.clone()
                }
                None => {
                    let directory = self.directory.clone();
                    let id = user.clone();
                    let fetch = async move { directory.get_profile(&id).await }
                        .boxed()
                        .shared();
                    state.in_flight.insert(user.clone(), fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;

        let mut state = self.state.lock().unwrap();
        // An invalidate may have replaced the entry with a newer lookup
        if state
            .in_flight
            .get(user)
            .is_some_and(|current| current.ptr_eq(&fetch))
        {
            state.in_flight.remove(user);
            if let Ok(profile) = &result {
                state.cache.insert(user.clone(), profile.clone());
            }
        }
        if let Err(e) = &result {
            warn!(user_id = %user, error = %e, "Profile lookup failed");
        }
        result
    }

    /// Resolve, degrading to the anonymous placeholder on failure.
    pub async fn resolve_or_placeholder(&self, user: &UserId) -> Profile {
        match self.resolve(user).await {
            Ok(profile) => profile,
            Err(_) => Profile::placeholder(user.clone()),
        }
    }

    /// Seed the cache with a profile already known to the caller.
    pub fn prime(&self, profile: Profile) {
        let mut state = self.state.lock().unwrap();
        state.cache.insert(profile.user_id.clone(), profile);
    }

    /// Forget a user so the next `resolve` refetches.
    pub fn invalidate(&self, user: &UserId) {
        let mut state = self.state.lock().unwrap();
        state.cache.remove(user);
        state.in_flight.remove(user);
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }
}
