//! Revoked session tokens.
//!
//! The cache is a build-then-swap snapshot refreshed from a [`TokenBlacklistSource`] by the
//! background synchroniser in [`crate::sync`]. Request handlers only ever read it.

use crate::snapshot::Snapshot;
use crate::sync::CacheSyncError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use uuid::Uuid;

/// A revoked session id, remembered until the session would have expired anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistedToken {
    pub id: Uuid,
    pub expires: DateTime<Utc>,
}

/// Where revoked sessions are recorded.
#[async_trait]
pub trait TokenBlacklistSource: Send + Sync {
    async fn blacklisted(&self) -> Result<Vec<BlacklistedToken>, CacheSyncError>;

    async fn blacklist(&self, token: BlacklistedToken) -> Result<(), CacheSyncError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlacklistSource {
    tokens: RwLock<Vec<BlacklistedToken>>,
}

impl InMemoryBlacklistSource {
    pub fn new(tokens: Vec<BlacklistedToken>) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }
}

#[async_trait]
impl TokenBlacklistSource for InMemoryBlacklistSource {
    async fn blacklisted(&self) -> Result<Vec<BlacklistedToken>, CacheSyncError> {
        Ok(self.tokens.read().clone())
    }

    async fn blacklist(&self, token: BlacklistedToken) -> Result<(), CacheSyncError> {
        self.tokens.write().push(token);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TokenBlacklistCache {
    tokens: Snapshot<HashMap<Uuid, DateTime<Utc>>>,
    /// Local additions the source has not reported yet.
    pending: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl TokenBlacklistCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set, discarding entries that have already expired.
    ///
    /// Local additions the source does not report yet are carried over until they expire.
    ///
    /// # Returns
    ///
    /// The number of live entries now held.
    pub fn overwrite(&self, tokens: Vec<BlacklistedToken>, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        self.tokens.rebuild(|_| {
            let mut next = HashMap::with_capacity(tokens.len());
            for token in tokens.into_iter().filter(|t| t.expires > now) {
                keep_latest(&mut next, token.id, token.expires);
            }
            let mut pending = self.pending.lock();
            pending.retain(|id, expires| *expires > now && !next.contains_key(id));
            for (id, expires) in pending.iter() {
                keep_latest(&mut next, *id, *expires);
            }
            count = next.len();
            next
        });
        count
    }

    /// Add one entry ahead of the next refresh.
    pub fn add(&self, token: BlacklistedToken) {
        keep_latest(&mut self.pending.lock(), token.id, token.expires);
        self.tokens.rebuild(|current| {
            let mut next = current.clone();
            keep_latest(&mut next, token.id, token.expires);
            next
        });
    }

    pub fn is_blacklisted(&self, id: &Uuid, now: DateTime<Utc>) -> bool {
        self.tokens
            .load()
            .get(id)
            .is_some_and(|expires| *expires > now)
    }

    pub fn len(&self) -> usize {
        self.tokens.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn keep_latest(tokens: &mut HashMap<Uuid, DateTime<Utc>>, id: Uuid, expires: DateTime<Utc>) {
    tokens
        .entry(id)
        .and_modify(|current| {
            if expires > *current {
                *current = expires;
            }
        })
        .or_insert(expires);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires: DateTime<Utc>) -> BlacklistedToken {
        BlacklistedToken {
            id: Uuid::new_v4(),
            expires,
        }
    }

    #[test]
    fn test_overwrite_drops_expired_tokens() {
        let now = Utc::now();
        let live = token(now + Duration::hours(1));
        let stale = token(now - Duration::minutes(1));
        let cache = TokenBlacklistCache::new();

        assert_eq!(cache.overwrite(vec![live, stale], now), 1);
        assert!(cache.is_blacklisted(&live.id, now));
        assert!(!cache.is_blacklisted(&stale.id, now));
    }

    #[test]
    fn test_entry_lapses_at_expiry() {
        let now = Utc::now();
        let live = token(now + Duration::minutes(5));
        let cache = TokenBlacklistCache::new();
        cache.add(live);

        assert!(cache.is_blacklisted(&live.id, now));
        assert!(!cache.is_blacklisted(&live.id, now + Duration::minutes(5)));
    }

    #[test]
    fn test_duplicate_ids_keep_latest_expiry() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let cache = TokenBlacklistCache::new();
        cache.overwrite(
            vec![
                BlacklistedToken {
                    id,
                    expires: now + Duration::hours(2),
                },
                BlacklistedToken {
                    id,
                    expires: now + Duration::minutes(1),
                },
            ],
            now,
        );
        assert_eq!(cache.len(), 1);
        assert!(cache.is_blacklisted(&id, now + Duration::hours(1)));
    }

    #[test]
    fn test_local_additions_survive_refresh_until_reported() {
        let now = Utc::now();
        let local = token(now + Duration::hours(1));
        let cache = TokenBlacklistCache::new();
        cache.add(local);

        assert_eq!(cache.overwrite(vec![], now), 1);
        assert!(cache.is_blacklisted(&local.id, now));

        cache.overwrite(vec![local], now);
        assert_eq!(cache.overwrite(vec![], now), 0);
        assert!(!cache.is_blacklisted(&local.id, now));
    }

    #[test]
    fn test_expired_local_additions_are_not_carried_over() {
        let now = Utc::now();
        let local = token(now + Duration::minutes(1));
        let cache = TokenBlacklistCache::new();
        cache.add(local);

        assert_eq!(cache.overwrite(vec![], now + Duration::minutes(2)), 0);
        assert!(!cache.is_blacklisted(&local.id, now));
    }

    #[test]
    fn test_additions_during_refreshes_are_kept() {
        let now = Utc::now();
        let cache = std::sync::Arc::new(TokenBlacklistCache::new());
        let added: Vec<BlacklistedToken> =
            (0..200).map(|_| token(now + Duration::hours(1))).collect();

        let writer = {
            let cache = std::sync::Arc::clone(&cache);
            let added = added.clone();
            std::thread::spawn(move || {
                for entry in added {
                    cache.add(entry);
                }
            })
        };
        for _ in 0..200 {
            cache.overwrite(vec![], now);
        }
        writer.join().expect("writer should finish");

        cache.overwrite(vec![], now);
        assert!(added.iter().all(|t| cache.is_blacklisted(&t.id, now)));
    }

    #[tokio::test]
    async fn test_in_memory_source_records_new_entries() {
        let source = InMemoryBlacklistSource::default();
        let entry = token(Utc::now() + Duration::hours(1));
        source.blacklist(entry).await.expect("should record");
        let all = source.blacklisted().await.expect("should list");
        assert_eq!(all, vec![entry]);
    }
}
