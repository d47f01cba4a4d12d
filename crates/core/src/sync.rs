//! Interval refresh of snapshot caches.
//!
//! A failed refresh is logged and the previous snapshot stays authoritative until the next
//! tick.

use crate::blacklist::{TokenBlacklistCache, TokenBlacklistSource};
use crate::network::NetworkRegistry;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheSyncError {
    #[error("cache source unavailable: {0}")]
    Source(String),
    #[error("cache source returned invalid data: {0}")]
    Invalid(String),
}

/// A cache that can rebuild itself from its source of truth.
#[async_trait]
pub trait Synchroniser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rebuild and swap the cache, returning how many entries it now holds.
    async fn refresh(&self) -> Result<usize, CacheSyncError>;
}

pub struct BlacklistSynchroniser {
    source: Arc<dyn TokenBlacklistSource>,
    cache: Arc<TokenBlacklistCache>,
}

impl BlacklistSynchroniser {
    pub fn new(source: Arc<dyn TokenBlacklistSource>, cache: Arc<TokenBlacklistCache>) -> Self {
        Self { source, cache }
    }
}

#[async_trait]
impl Synchroniser for BlacklistSynchroniser {
    fn name(&self) -> &'static str {
        "token-blacklist"
    }

    async fn refresh(&self) -> Result<usize, CacheSyncError> {
        let tokens = self.source.blacklisted().await?;
        Ok(self.cache.overwrite(tokens, Utc::now()))
    }
}

/// Re-reads endpoints from the store so out-of-band edits reach the dispatch cache.
pub struct EndpointSynchroniser {
    registry: Arc<NetworkRegistry>,
}

impl EndpointSynchroniser {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Synchroniser for EndpointSynchroniser {
    fn name(&self) -> &'static str {
        "network-endpoints"
    }

    async fn refresh(&self) -> Result<usize, CacheSyncError> {
        self.registry
            .refresh()
            .await
            .map_err(|e| CacheSyncError::Source(e.to_string()))
    }
}

/// Run one refresh, logging the outcome. Returns whether it succeeded.
pub async fn sync_once(synchroniser: &dyn Synchroniser) -> bool {
    match synchroniser.refresh().await {
        Ok(count) => {
            tracing::debug!(cache = synchroniser.name(), entries = count, "cache refreshed");
            true
        }
        Err(e) => {
            tracing::error!(
                cache = synchroniser.name(),
                "cache refresh failed, keeping previous snapshot: {}",
                e
            );
            false
        }
    }
}

/// Refresh `synchroniser` every `period` until `shutdown` turns true or its sender is dropped.
///
/// The first refresh runs immediately.
pub fn spawn_interval(
    synchroniser: Arc<dyn Synchroniser>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            cache = synchroniser.name(),
            period_secs = period.as_secs(),
            "cache synchroniser started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sync_once(synchroniser.as_ref()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(cache = synchroniser.name(), "cache synchroniser stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::BlacklistedToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FlakySource {
        calls: AtomicUsize,
        token: BlacklistedToken,
    }

    #[async_trait]
    impl TokenBlacklistSource for FlakySource {
        async fn blacklisted(&self) -> Result<Vec<BlacklistedToken>, CacheSyncError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(CacheSyncError::Source("database offline".into()));
            }
            Ok(vec![self.token])
        }

        async fn blacklist(&self, _token: BlacklistedToken) -> Result<(), CacheSyncError> {
            Ok(())
        }
    }

    fn flaky() -> Arc<FlakySource> {
        Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            token: BlacklistedToken {
                id: Uuid::new_v4(),
                expires: Utc::now() + chrono::Duration::hours(1),
            },
        })
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let source = flaky();
        let cache = Arc::new(TokenBlacklistCache::new());
        let sync = BlacklistSynchroniser::new(source.clone(), Arc::clone(&cache));

        assert!(sync_once(&sync).await);
        assert!(cache.is_blacklisted(&source.token.id, Utc::now()));

        assert!(!sync_once(&sync).await);
        assert!(cache.is_blacklisted(&source.token.id, Utc::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_retries_and_stops_on_shutdown() {
        let source = flaky();
        let cache = Arc::new(TokenBlacklistCache::new());
        let sync: Arc<dyn Synchroniser> =
            Arc::new(BlacklistSynchroniser::new(source.clone(), Arc::clone(&cache)));
        let (stop, shutdown) = watch::channel(false);

        let handle = spawn_interval(sync, Duration::from_secs(60), shutdown);
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(source.calls.load(Ordering::SeqCst) >= 3);
        assert!(cache.is_blacklisted(&source.token.id, Utc::now()));

        stop.send(true).expect("synchroniser should be listening");
        handle.await.expect("synchroniser should stop cleanly");
    }
}
