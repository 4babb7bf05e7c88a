//! On-disk cache of the downloaded proxy profile.
//!
//! Providers rate-limit subscription downloads, so the raw profile is kept
//! for a few days and reused across starts.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProfile {
    /// RFC 3339 time of the download.
    pub fetched_at: String,
    /// Account key the profile belongs to; a different login invalidates it.
    pub source: String,
    pub content: String,
}

impl CachedProfile {
    fn fetched_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.fetched_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub struct SubscriptionCache {
    path: PathBuf,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(path: PathBuf, ttl_hours: i64) -> Self {
        Self {
            path,
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, source: &str, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let cached = CachedProfile {
            fetched_at: Utc::now().to_rfc3339(),
            source: source.to_string(),
            content: content.to_string(),
        };
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&cached)?).await?;
        Ok(())
    }

    /// Whatever is on disk, fresh or not. Corrupt files are ignored.
    pub async fn load(&self) -> Option<CachedProfile> {
        let data = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str::<CachedProfile>(&data) {
            Ok(cached) => Some(cached),
            Err(e) => {
                tracing::warn!(
                    "corrupt subscription cache at {}, ignoring: {e}",
                    self.path.display()
                );
                None
            }
        }
    }

    /// Cached profile for `source` if younger than the TTL.
    pub async fn fresh(&self, source: &str) -> Option<String> {
        self.fresh_at(source, Utc::now()).await
    }

    async fn fresh_at(&self, source: &str, now: DateTime<Utc>) -> Option<String> {
        let cached = self.load().await?;
        if cached.source != source {
            return None;
        }
        let age = now - cached.fetched_at()?;
        (age < self.ttl).then_some(cached.content)
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://new.ednovas.dev/2cvme3wa8i/tok&flag=clash";

    #[tokio::test]
    async fn fresh_within_ttl_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path().join("subscription.json"), 72);
        cache.save(URL, "proxies: []\n").await.unwrap();

        assert_eq!(cache.fresh(URL).await.as_deref(), Some("proxies: []\n"));
        let later = Utc::now() + Duration::hours(73);
        assert!(cache.fresh_at(URL, later).await.is_none());
        // Stale entries are still loadable as a last resort.
        assert!(cache.load().await.is_some());
    }

    #[tokio::test]
    async fn other_source_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path().join("subscription.json"), 72);
        cache.save(URL, "a").await.unwrap();
        assert!(cache.fresh("https://other/sub").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_or_missing_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path().join("subscription.json"), 72);
        assert!(cache.load().await.is_none());
        tokio::fs::write(cache.path(), "not valid json {{{").await.unwrap();
        assert!(cache.load().await.is_none());
        cache.clear().await.unwrap();
        cache.clear().await.unwrap();
    }
}
