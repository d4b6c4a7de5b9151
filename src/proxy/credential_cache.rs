use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::identity_source::{IdentitySource, IdentitySourceError};
use super::lookup_retry::LookupRetry;
use super::signing::SigningCredential;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no accessKeyId found in cache")]
    NotFound,
    #[error("unable to load user credentials: {0}")]
    Source(#[from] IdentitySourceError),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Entries not renewed within this window are never returned. Every
    /// refresh renews them, a failed one included. `None` keeps them until a
    /// successful refresh drops them.
    pub ttl: Option<Duration>,
    /// How often expired entries are reclaimed.
    pub evict_interval: Duration,
    pub lookup_retry: LookupRetry,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: None,
            evict_interval: Duration::from_secs(10 * 60),
            lookup_retry: LookupRetry::default(),
        }
    }
}

/// In-memory projection of the identity source's `access key -> secret`
/// table.
///
/// Each key is replaced atomically, so a reader sees either the credential
/// from before a refresh or the one after it.
pub struct CredentialCache {
    source: Arc<dyn IdentitySource>,
    entries: Cache<String, SigningCredential>,
    settings: CacheSettings,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn IdentitySource>, settings: CacheSettings) -> Self {
        let mut builder = Cache::builder();
        if let Some(ttl) = settings.ttl {
            builder = builder.time_to_live(ttl);
        }
        let entries: Cache<String, SigningCredential> = builder.build();

        Self {
            source,
            entries,
            settings,
        }
    }

    /// Fetches the full table and installs it. Keys missing from the new
    /// table are dropped; on error the current entries are left untouched.
    #[instrument(name = "credential_cache_load", skip(self))]
    pub async fn load(&self) -> Result<usize, CacheError> {
        let fresh: HashMap<String, String> = self.source.load_user_credentials().await?;
        debug!("loading {} keys from identity source", fresh.len());
        if fresh.is_empty() {
            warn!("identity source returned no credentials");
        }

        for (access_key_id, secret_key) in &fresh {
            self.entries.insert(
                access_key_id.clone(),
                SigningCredential::new(access_key_id.as_str(), secret_key.as_str()),
            );
        }

        let mut dropped = 0;
        for (access_key_id, _) in self.entries.iter() {
            if !fresh.contains_key(access_key_id.as_str()) {
                self.entries.invalidate(access_key_id.as_str());
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!("dropped {} access keys no longer known to the identity source", dropped);
        }

        Ok(fresh.len())
    }

    /// Looks up the credential for `access_key_id`, retrying briefly to ride
    /// out lookups that race a refresh.
    pub async fn get_signer(&self, access_key_id: &str) -> Result<SigningCredential, CacheError> {
        let mut delays = self.settings.lookup_retry.delays();
        loop {
            if let Some(credential) = self.entries.get(access_key_id) {
                return Ok(credential);
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    debug!("access key {} not in cache", access_key_id);
                    return Err(CacheError::NotFound);
                }
            }
        }
    }

    /// Re-inserts every cached entry so its time to live starts over. Keeps
    /// the last known table alive while the identity source is failing.
    pub fn renew_entries(&self) {
        if self.settings.ttl.is_none() {
            return;
        }
        let current: Vec<(Arc<String>, SigningCredential)> = self.entries.iter().collect();
        debug!("renewing {} cached entries", current.len());
        for (access_key_id, credential) in current {
            self.entries.insert(access_key_id.as_ref().clone(), credential);
        }
    }

    /// Reclaims expired entries.
    pub fn evict_expired(&self) {
        self.entries.run_pending_tasks();
    }

    /// Starts the single background task that reloads the cache every
    /// `interval` until `shutdown` is cancelled.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.run_refresh(interval, shutdown).await })
    }

    async fn run_refresh(&self, interval: Duration, shutdown: CancellationToken) {
        let mut refresh = interval_at(Instant::now() + interval, interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let evict_every = self.settings.evict_interval;
        let mut evict = interval_at(Instant::now() + evict_every, evict_every);
        evict.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("credential refresh running every {:?}", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping credential refresh");
                    return;
                }
                _ = refresh.tick() => {
                    info!("starting credential cache sync");
                    match self.load().await {
                        Ok(count) => info!("finished credential cache sync with {} keys", count),
                        Err(e) => {
                            error!("unable to refresh user credentials, keeping cached entries: {}", e);
                            self.renew_entries();
                        }
                    }
                }
                _ = evict.tick() => self.evict_expired(),
            }
        }
    }
}
