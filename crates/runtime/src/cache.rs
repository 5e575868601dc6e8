use std::{
    collections::HashSet,
    fmt,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

/// Content-addressed cache key: `namespace` plus the blake3 hash of the
/// canonical JSON form of some input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Inputs that differ only in object key order or in surrounding or
    /// repeated whitespace of string values map to the same key. Letter case
    /// is kept; callers lowercase free text themselves when it is not
    /// significant.
    pub fn from_parts(
        namespace: &str,
        parts: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        let canonical = canonicalize(serde_json::to_value(parts)?);
        let encoded = serde_json::to_vec(&canonical)?;
        let digest = blake3::hash(&encoded);
        Ok(Self(format!("{namespace}:{}", digest.to_hex())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries = object.into_iter().collect::<Vec<_>>();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::String(text) => Value::String(collapse_whitespace(&text)),
        other => other,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-collapsed, lowercased form of free text such as a search query.
pub(crate) fn normalize_text(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    tags: Vec<String>,
}

/// TTL cache with tag-based invalidation, safe to share without external
/// locking.
///
/// Each tag carries a generation that `invalidate_tag` bumps. A value
/// computed while one of its tags was invalidated is returned to its caller
/// but never stored.
pub struct ResultCache<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    tags: DashMap<String, HashSet<CacheKey>>,
    generations: DashMap<String, AtomicU64>,
}

impl<V> Default for ResultCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            tags: DashMap::new(),
            generations: DashMap::new(),
        }
    }
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.invalidate(key);
        }
        None
    }

    pub fn insert(&self, key: CacheKey, value: V, ttl: Duration, tags: &[String]) {
        for tag in tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                tags: tags.to_vec(),
            },
        );
    }

    /// Returns the cached value or computes, stores and returns a fresh one.
    /// The flag is `true` on a cache hit. Errors are never cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        ttl: Duration,
        tags: &[String],
        compute: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok((value, true));
        }
        let before = self.generations_of(tags);
        let value = compute().await?;
        if self.generations_of(tags) == before {
            self.insert(key, value.clone(), ttl, tags);
        } else {
            tracing::debug!(key = %key, "tag invalidated during compute; result not cached");
        }
        Ok((value, false))
    }

    fn generations_of(&self, tags: &[String]) -> Vec<u64> {
        tags.iter()
            .map(|tag| {
                self.generations
                    .get(tag)
                    .map_or(0, |generation| generation.load(Ordering::Acquire))
            })
            .collect()
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(mut keys) = self.tags.get_mut(tag) {
                keys.remove(key);
            }
            self.tags.remove_if(tag, |_, keys| keys.is_empty());
        }
        true
    }

    /// Drops every entry carrying `tag`. Returns how many were removed.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.generations
            .entry(tag.to_owned())
            .or_default()
            .fetch_add(1, Ordering::AcqRel);
        let Some((_, keys)) = self.tags.remove(tag) else {
            return 0;
        };
        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        expired.iter().filter(|key| self.invalidate(key)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
