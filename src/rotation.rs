//! Rotation state store — Redis-backed with a process-local fallback.
//!
//! Rotation descriptors are small JSON records keyed by string. Redis is
//! the shared tier; every write also lands in an in-memory map so a cache
//! outage degrades to per-process correctness instead of failing the
//! request. The store is the only component that talks to Redis.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Rotation entries expire after 24h; absence means "start a fresh cycle".
pub const ROTATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ── Descriptor records ──────────────────────────────────────────────────

/// Per-contact rotation state. `used_instances` is a set serialized as a
/// list; ordering is irrelevant to consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationDescriptor {
    pub used_instances: Vec<String>,
    pub last_used_instance: Option<String>,
    pub rotation_count: i64,
}

impl RotationDescriptor {
    pub fn has_used(&self, instance: &str) -> bool {
        self.used_instances.iter().any(|i| i == instance)
    }
}

/// Round-robin cursor shared by all contacts of one group (or the
/// top-level global cursor for ungrouped sends).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRotation {
    pub last_used_instance: Option<String>,
    pub rotation_count: i64,
}

// ── Store ───────────────────────────────────────────────────────────────

pub struct RotationStore {
    redis: Option<ConnectionManager>,
    fallback: DashMap<String, (String, Instant)>,
}

impl RotationStore {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            redis,
            fallback: DashMap::new(),
        }
    }

    /// Read a descriptor. Redis first; on error or miss, the in-memory
    /// fallback entry if one is present and unexpired.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(Some(raw)) => match serde_json::from_str(&raw) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        tracing::warn!("rotation_store: corrupt cache entry for {}: {}", key, e);
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("rotation_store: cache read failed for {}: {}", key, e);
                }
            }
        }
        self.get_fallback(key)
    }

    /// Write a descriptor to both tiers. Cache errors are logged and
    /// absorbed; the fallback map is always updated.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("rotation_store: serialize failed for {}: {}", key, e);
                return;
            }
        };

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Err(e) = conn
                .set_ex::<_, _, ()>(key, raw.as_str(), ttl.as_secs())
                .await
            {
                tracing::warn!("rotation_store: cache write failed for {}: {}", key, e);
            }
        }

        self.fallback
            .insert(key.to_string(), (raw, Instant::now() + ttl));
    }

    /// Remove a key from both tiers.
    pub async fn delete(&self, key: &str) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Err(e) = conn.del::<_, ()>(key).await {
                tracing::warn!("rotation_store: cache delete failed for {}: {}", key, e);
            }
        }
        self.fallback.remove(key);
    }

    /// Watchdog hook: true when Redis answers PING (or is not configured).
    pub async fn ping(&self) -> bool {
        match &self.redis {
            Some(redis) => {
                let mut conn = redis.clone();
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .is_ok()
            }
            None => true,
        }
    }

    pub fn has_cache(&self) -> bool {
        self.redis.is_some()
    }

    fn get_fallback<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.fallback.get(key)?;
        let (raw, expires_at) = entry.value();
        if Instant::now() >= *expires_at {
            drop(entry);
            self.fallback.remove(key);
            return None;
        }
        serde_json::from_str(raw).ok()
    }
}
