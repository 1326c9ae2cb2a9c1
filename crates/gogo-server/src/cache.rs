//! Key/value cache holding recent message lists.
//!
//! Two back-ends implement [`MessageCache`]: Redis for deployments that run
//! several hubs, and an in-process TTL map for local runs and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;

/// Batch size hint for `SCAN` when deleting by pattern.
const SCAN_COUNT: usize = 200;

/// Cache key of the recent-message list between two users.
///
/// The pair is ordered so both directions share one list.
pub fn conversation_key(user_a: &str, user_b: &str) -> String {
    let (first, second) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("message_list_{first}_{second}")
}

/// Cache key of the recent-message list of a group.
pub fn group_key(group_id: &str) -> String {
    format!("group_messagelist_{group_id}")
}

/// String-keyed cache with a fixed expiry unit (seconds).
#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key matching a Redis-style glob pattern.
    /// Returns the number of deleted keys.
    async fn del_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    async fn del_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.del_pattern(&format!("{prefix}*")).await
    }

    async fn del_suffix(&self, suffix: &str) -> Result<usize, CacheError> {
        self.del_pattern(&format!("*{suffix}")).await
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Redis-backed cache. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl MessageCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: i64 = conn.del(&keys).await?;
                deleted += removed.max(0) as usize;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern, deleted, "Deleted cache keys by pattern");
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedEntry {
    value: String,
    expires_at: Instant,
}

impl CachedEntry {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process cache with per-entry expiry.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CachedEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry.
    pub async fn purge_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh());
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired cache entries");
        }
    }
}

#[async_trait]
impl MessageCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CachedEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = Pattern::new(pattern)?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_key_is_symmetric() {
        assert_eq!(conversation_key("U2", "U1"), "message_list_U1_U2");
        assert_eq!(conversation_key("U1", "U2"), conversation_key("U2", "U1"));
        assert_eq!(group_key("G7"), "group_messagelist_G7");
    }

    #[tokio::test]
    async fn test_memory_cache_glob_classes() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        for key in ["G1", "G2", "G3", "G12", "message_list_U1_U2"] {
            cache.set_ex(key, "[]", ttl).await.unwrap();
        }

        assert_eq!(cache.del_pattern("G[12]").await.unwrap(), 2);
        assert!(cache.get("G3").await.unwrap().is_some());
        assert!(cache.get("G12").await.unwrap().is_some());

        assert_eq!(cache.del_pattern("G?").await.unwrap(), 1);
        assert_eq!(cache.del_pattern("*U1*").await.unwrap(), 1);
        assert!(cache.get("G12").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_cache_rejects_malformed_pattern() {
        let cache = MemoryCache::new();
        cache.set_ex("G1", "[]", Duration::from_secs(60)).await.unwrap();

        let err = cache.del_pattern("G[").await.unwrap_err();
        assert!(matches!(err, CacheError::Pattern(_)));
        assert!(cache.get("G1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_expires() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").await.unwrap().is_none());

        cache.purge_expired().await;
        assert!(cache.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_pattern_deletes() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set_ex("message_list_U1_U2", "[]", ttl).await.unwrap();
        cache.set_ex("message_list_U1_U3", "[]", ttl).await.unwrap();
        cache.set_ex("group_messagelist_G1", "[]", ttl).await.unwrap();

        assert_eq!(cache.del_suffix("_U3").await.unwrap(), 1);
        assert_eq!(cache.del_prefix("message_list_").await.unwrap(), 1);
        assert!(cache.get("group_messagelist_G1").await.unwrap().is_some());

        cache.del("group_messagelist_G1").await.unwrap();
        assert!(cache.get("group_messagelist_G1").await.unwrap().is_none());
    }
}
