//! Count aggregation for the request path.
//!
//! Resolves the viewer behind an authorization token, derives every scope
//! key they may see for a URL, and sums those counters in one store read.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::api::{AnnotationApi, ApiError};
use crate::models::Principal;
use crate::scope::{count_key, derive_scope_key, profile_key, Scope};
use crate::store::{CounterStore, StoreError};

/// How long a resolved viewer stays cached.
pub const DEFAULT_PROFILE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Identity lookup failed: {0}")]
    Identity(#[from] ApiError),
}

#[derive(Clone)]
pub struct CountAggregator {
    store: Arc<dyn CounterStore>,
    api: Arc<dyn AnnotationApi>,
    profile_ttl: Duration,
}

impl CountAggregator {
    pub fn new(store: Arc<dyn CounterStore>, api: Arc<dyn AnnotationApi>) -> Self {
        Self {
            store,
            api,
            profile_ttl: DEFAULT_PROFILE_TTL,
        }
    }

    pub fn with_profile_ttl(mut self, ttl: Duration) -> Self {
        self.profile_ttl = ttl;
        self
    }

    /// Number of annotations on `url` visible to the bearer of `auth`.
    pub async fn fetch_count(&self, url: &str, auth: Option<&str>) -> Result<i64, AggregateError> {
        let principal = self.principal(auth).await?;
        let keys: Vec<String> = visible_scopes(&principal)
            .iter()
            .map(|scope| count_key(&derive_scope_key(url, scope)))
            .collect();

        Ok(self.store.sum(&keys).await?)
    }

    /// Resolve the viewer, from cache when possible.
    async fn principal(&self, auth: Option<&str>) -> Result<Principal, AggregateError> {
        let cache_key = profile_key(auth.unwrap_or(""));

        if let Some(cached) = self.store.get_json(&cache_key).await? {
            match serde_json::from_value::<Principal>(cached) {
                Ok(principal) => return Ok(principal),
                Err(e) => debug!("Discarding unreadable cached profile: {}", e),
            }
        }

        let (profile, groups) = tokio::join!(self.api.profile(auth), self.api.groups(auth));
        let principal = Principal::new(profile?, groups?);

        let cached = serde_json::to_value(&principal).map_err(StoreError::from)?;
        self.store
            .put_json_expiring(&cache_key, &cached, self.profile_ttl)
            .await?;
        Ok(principal)
    }
}

/// Scopes whose counters the viewer may read.
fn visible_scopes(principal: &Principal) -> Vec<Scope> {
    let user = principal
        .profile
        .userid
        .as_deref()
        .and_then(|userid| Scope::for_userid(userid).ok());

    user.into_iter()
        .chain(
            principal
                .groups
                .iter()
                .map(|group| Scope::Group(group.id.clone())),
        )
        .collect()
}
