//! Metadata-backed registry of relying parties.
//!
//! Party configuration is pulled from a [`MetadataSource`] and cached. When a
//! refresh fails, the last good copy stays in service; lookups only fail once
//! no copy has ever been loaded.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{IdpError, IdpResult};
use crate::party::RelyingParty;

/// Where party metadata comes from. Production deployments fetch and parse
/// remote metadata documents; tests hand back fixed descriptors.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn load(&self) -> IdpResult<Vec<RelyingParty>>;
}

struct Cache {
    parties: HashMap<String, Arc<RelyingParty>>,
    loaded_at: Option<DateTime<Utc>>,
}

pub struct PartyRegistry {
    source: Arc<dyn MetadataSource>,
    refresh_interval: Duration,
    cache: RwLock<Cache>,
}

impl PartyRegistry {
    pub fn new(source: Arc<dyn MetadataSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval,
            cache: RwLock::new(Cache {
                parties: HashMap::new(),
                loaded_at: None,
            }),
        }
    }

    /// Look up an enabled party, refreshing stale metadata first.
    pub async fn find(&self, entity_id: &str) -> IdpResult<Arc<RelyingParty>> {
        self.refresh_if_stale().await?;
        let cache = self.cache.read().await;
        cache
            .parties
            .get(entity_id)
            .filter(|p| p.enabled)
            .cloned()
            .ok_or_else(|| IdpError::UnknownRelyingParty(entity_id.to_string()))
    }

    /// All enabled parties, sorted by entity id.
    pub async fn all(&self) -> IdpResult<Vec<Arc<RelyingParty>>> {
        self.refresh_if_stale().await?;
        let cache = self.cache.read().await;
        let mut parties: Vec<_> = cache.parties.values().filter(|p| p.enabled).cloned().collect();
        parties.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(parties)
    }

    async fn refresh_if_stale(&self) -> IdpResult<()> {
        let now = Utc::now();
        {
            let cache = self.cache.read().await;
            if let Some(loaded) = cache.loaded_at {
                if now - loaded < self.refresh_interval {
                    return Ok(());
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(loaded) = cache.loaded_at {
            if now - loaded < self.refresh_interval {
                return Ok(());
            }
        }

        match self.source.load().await {
            Ok(parties) => {
                cache.parties = parties
                    .into_iter()
                    .map(|p| (p.entity_id.clone(), Arc::new(p)))
                    .collect();
                cache.loaded_at = Some(now);
                tracing::info!(count = cache.parties.len(), "party metadata refreshed");
                Ok(())
            }
            Err(err) if cache.loaded_at.is_some() => {
                // Keep serving the stale copy but retry on the next lookup
                // after another full interval.
                tracing::warn!(error = %err, "metadata refresh failed, serving stale copy");
                cache.loaded_at = Some(now);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "initial metadata load failed");
                Err(IdpError::MetadataUnavailable(
                    "initial metadata load failed".to_string(),
                ))
            }
        }
    }
}

/// Fixed metadata for tests and bootstrap configuration.
pub struct StaticMetadataSource {
    parties: RwLock<Vec<RelyingParty>>,
    fail: RwLock<bool>,
}

impl StaticMetadataSource {
    #[must_use]
    pub fn new(parties: Vec<RelyingParty>) -> Self {
        Self {
            parties: RwLock::new(parties),
            fail: RwLock::new(false),
        }
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn replace(&self, parties: Vec<RelyingParty>) {
        *self.parties.write().await = parties;
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn load(&self) -> IdpResult<Vec<RelyingParty>> {
        if *self.fail.read().await {
            return Err(IdpError::MetadataUnavailable(
                "source configured to fail".to_string(),
            ));
        }
        Ok(self.parties.read().await.clone())
    }
}
