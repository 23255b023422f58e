//! Content-Addressable Output Store: hashes canonicalized transcode
//! parameters to deduplicate work and to serve CDN-friendly immutable URLs.
//!
//! Layout on disk: `content/<hash[0:2]>/<hash[2:4]>/<hash>/{manifest.ext, ...}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{ContentEntry, ContentStatus};
use crate::error::{CoreError, CoreResult};

/// Computes the canonical fingerprint for a transcode request. Two requests
/// that would produce identical output share this hash.
pub fn hash_request(
    input_path: &Path,
    container: &str,
    video_codec: &str,
    audio_codec: &str,
    quality: u8,
    resolution: Option<(u32, u32)>,
    enable_abr: bool,
    ladder_fingerprint: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input_path.to_string_lossy().as_bytes());
    hasher.update(b"|");
    hasher.update(container.as_bytes());
    hasher.update(b"|");
    hasher.update(video_codec.as_bytes());
    hasher.update(b"|");
    hasher.update(audio_codec.as_bytes());
    hasher.update(b"|");
    hasher.update(quality.to_le_bytes());
    hasher.update(b"|");
    if let Some((w, h)) = resolution {
        hasher.update(format!("{}x{}", w, h).as_bytes());
    }
    hasher.update(b"|");
    hasher.update([enable_abr as u8]);
    hasher.update(b"|");
    hasher.update(ladder_fingerprint.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ContentStore {
    root: PathBuf,
    ttl: Duration,
    entries: RwLock<HashMap<String, ContentEntry>>,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { root: root.into(), ttl, entries: RwLock::new(HashMap::new()) }
    }

    fn dir_for(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[0..2]).join(&hash[2..4]).join(hash)
    }

    /// `Locate(hash) -> (dir, status) | NotFound`.
    pub async fn locate(&self, hash: &str) -> CoreResult<(PathBuf, ContentStatus)> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(hash) {
            entry.last_accessed = Instant::now();
            return Ok((entry.output_dir.clone(), entry.status));
        }
        drop(entries);

        let dir = self.dir_for(hash);
        if !dir.exists() {
            return Err(CoreError::NotFound(format!("no content entry for {}", hash)));
        }
        let status = if dir.join("manifest.mpd").exists()
            || dir.join("master.m3u8").exists()
            || dir.join("output.mp4").exists()
        {
            ContentStatus::Complete
        } else {
            ContentStatus::Pending
        };
        let entry = ContentEntry {
            hash: hash.to_string(),
            output_dir: dir.clone(),
            created_at: Instant::now(),
            last_accessed: Instant::now(),
            status,
            manifest_path: None,
            segment_layout: None,
        };
        self.entries.write().await.insert(hash.to_string(), entry);
        Ok((dir, status))
    }

    /// `Allocate(hash) -> dir`. Creates a fresh directory atomically via a
    /// temp path + rename, failing loudly if another writer already won.
    pub async fn allocate(&self, hash: &str) -> CoreResult<PathBuf> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(hash) {
            return Ok(entry.output_dir.clone());
        }

        let dir = self.dir_for(hash);
        if dir.exists() {
            let entry = ContentEntry {
                hash: hash.to_string(),
                output_dir: dir.clone(),
                created_at: Instant::now(),
                last_accessed: Instant::now(),
                status: ContentStatus::Pending,
                manifest_path: None,
                segment_layout: None,
            };
            entries.insert(hash.to_string(), entry);
            return Ok(dir);
        }

        let parent = dir.parent().expect("content dir always has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::LaunchFailed(format!("creating content parent dir: {}", e)))?;

        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(|e| CoreError::LaunchFailed(format!("creating staging dir: {}", e)))?;

        match tokio::fs::rename(&tmp, &dir).await {
            Ok(()) => {
                debug!(hash = %hash, dir = %dir.display(), "allocated content directory");
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&tmp).await;
                if dir.exists() {
                    return Err(CoreError::InvalidRequest(format!(
                        "content directory for {} already exists (AlreadyExists)",
                        hash
                    )));
                }
                return Err(CoreError::LaunchFailed(format!("renaming staging dir: {}", e)));
            }
        }

        let entry = ContentEntry {
            hash: hash.to_string(),
            output_dir: dir.clone(),
            created_at: Instant::now(),
            last_accessed: Instant::now(),
            status: ContentStatus::Pending,
            manifest_path: None,
            segment_layout: None,
        };
        entries.insert(hash.to_string(), entry);
        Ok(dir)
    }

    /// Snapshot of a known entry, without touching the filesystem. Returns
    /// `None` if the entry hasn't been seen by [locate]/[allocate] yet.
    pub async fn get(&self, hash: &str) -> Option<ContentEntry> {
        self.entries.read().await.get(hash).cloned()
    }

    /// `ResolveURL(hash, file) -> "/content/<hash>/<file>"`.
    pub fn resolve_url(&self, hash: &str, file: &str) -> String {
        format!("/content/{}/{}", hash, file)
    }

    pub async fn mark_complete(&self, hash: &str, manifest_path: PathBuf, segment_layout: Option<String>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(hash) {
            entry.status = ContentStatus::Complete;
            entry.manifest_path = Some(manifest_path);
            entry.segment_layout = segment_layout;
        }
    }

    pub async fn mark_failed(&self, hash: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(hash) {
            entry.status = ContentStatus::Failed;
        }
    }

    /// Evicts entries whose `last_accessed` exceeds the configured TTL or
    /// whose status is `failed`. Never races a live session: this takes the
    /// same write lock session allocation uses, so a sweep and a launch can
    /// never observe the same entry mid-transition.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut evicted = Vec::new();
        entries.retain(|hash, entry| {
            let stale = entry.last_accessed.elapsed() > self.ttl;
            let dead = entry.status == ContentStatus::Failed;
            if stale || dead {
                evicted.push((hash.clone(), entry.output_dir.clone()));
                false
            } else {
                true
            }
        });
        drop(entries);

        for (hash, dir) in &evicted {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                warn!(hash = %hash, error = %e, "failed to remove evicted content directory");
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "swept content store entries");
        }
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn hash_is_deterministic_and_order_sensitive() {
        let a = hash_request(
            &PathBuf::from("/m/a.mkv"), "dash", "h264", "aac", 70, None, true, "ladder-v1",
        );
        let b = hash_request(
            &PathBuf::from("/m/a.mkv"), "dash", "h264", "aac", 70, None, true, "ladder-v1",
        );
        assert_eq!(a, b);

        let c = hash_request(
            &PathBuf::from("/m/a.mkv"), "dash", "h264", "aac", 90, None, true, "ladder-v1",
        );
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn allocate_then_locate_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::new(tmp.path(), Duration::from_secs(3600));
        let hash = "a".repeat(64);
        let dir = store.allocate(&hash).await.unwrap();
        assert!(dir.exists());

        let again = store.allocate(&hash).await.unwrap();
        assert_eq!(dir, again);

        let (located, status) = store.locate(&hash).await.unwrap();
        assert_eq!(located, dir);
        assert_eq!(status, ContentStatus::Pending);
    }

    #[tokio::test]
    async fn sweep_evicts_failed_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::new(tmp.path(), Duration::from_secs(3600));
        let hash = "b".repeat(64);
        store.allocate(&hash).await.unwrap();
        store.mark_failed(&hash).await;

        let evicted = store.sweep().await;
        assert_eq!(evicted, 1);
        assert!(store.locate(&hash).await.is_err());
    }
}
