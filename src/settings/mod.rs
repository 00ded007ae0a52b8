mod client;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::AgentConfig;
use crate::policy::PolicySnapshot;

pub use client::SettingsClient;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("settings endpoint returned {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("settings payload could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

struct Cached {
    snapshot: PolicySnapshot,
    fetched_at: Instant,
}

/// Caches the latest policy from the control plane and serves non-blocking
/// snapshots.
///
/// The cache is the agent's only piece of module-level mutable state; it is
/// built once in `main` before any reader exists and lives for the process lifetime.
pub struct SettingsProvider {
    client: Arc<SettingsClient>,
    cached: Arc<RwLock<Cached>>,
    refreshing: Arc<AtomicBool>,
    ttl: Duration,
}

impl SettingsProvider {
    /// Performs one synchronous fetch with a bounded deadline. Fails construction
    /// (and thus agent startup) if that fetch does not succeed.
    pub async fn new(config: &AgentConfig) -> Result<Self, SettingsError> {
        let client = Arc::new(SettingsClient::new(config)?);
        let snapshot = client.fetch_settings().await?;
        tracing::info!(target: "settings", "initial settings fetch succeeded");
        Ok(Self {
            client,
            cached: Arc::new(RwLock::new(Cached { snapshot, fetched_at: Instant::now() })),
            refreshing: Arc::new(AtomicBool::new(false)),
            ttl: config.settings_cache_ttl,
        })
    }

    /// Never blocks, never fails after construction. Returns the current
    /// (possibly stale) snapshot and opportunistically kicks off a background
    /// refresh when the cache has aged past its TTL.
    pub fn snapshot(&self) -> PolicySnapshot {
        let (snapshot, is_stale) = {
            let guard = self.cached.read().expect("settings cache lock poisoned");
            (guard.snapshot.clone(), guard.fetched_at.elapsed() >= self.ttl)
        };

        if is_stale && self.refreshing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let client = self.client.clone();
            let cached = self.cached.clone();
            let refreshing = self.refreshing.clone();
            tokio::spawn(async move {
                match client.fetch_settings().await {
                    Ok(fresh) => {
                        let mut guard = cached.write().expect("settings cache lock poisoned");
                        guard.snapshot = fresh;
                        guard.fetched_at = Instant::now();
                        tracing::debug!(target: "settings", "background refresh succeeded");
                    }
                    Err(err) => {
                        tracing::warn!(target: "settings", "background refresh failed, keeping stale snapshot: {err}");
                    }
                }
                refreshing.store(false, Ordering::Release);
            });
        }

        snapshot
    }

    /// Test seam: builds a provider pre-seeded with `snapshot`, skipping the
    /// network fetch `new()` requires. Used by other modules' tests (e.g. the
    /// capture loop) that need a `SettingsProvider` but not a live server.
    #[cfg(test)]
    pub(crate) fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        let client = Arc::new(SettingsClient::new(&crate::config::test_config()).expect("build test settings client"));
        Self {
            client,
            cached: Arc::new(RwLock::new(Cached { snapshot, fetched_at: Instant::now() })),
            refreshing: Arc::new(AtomicBool::new(false)),
            ttl: Duration::from_secs(300),
        }
    }
}
