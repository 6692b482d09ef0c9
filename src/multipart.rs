//! Multipart Upload Coordinator (`spec.md` §4.5).
//!
//! Mints an opaque proxy upload id for every `CreateMultipartUpload` and
//! maps it to the per-backend upload ids minted by each backend's own
//! `CreateMultipartUpload` call. Entries expire after `MultipartUploadTtl`
//! and are swept periodically, mirroring the sweeper shape used for
//! connection/session tables throughout the corpus (grounded on the
//! teacher's background-task pattern in `server.rs`'s graceful-shutdown
//! loop, generalized to a periodic sweep instead of a one-shot drain).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::MultipartMapping;

/// Snapshot counters for `/metrics` and diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub active_uploads: usize,
    pub expired_swept: u64,
}

struct Inner {
    uploads: HashMap<String, MultipartMapping>,
    expired_swept: u64,
}

/// Owns the proxy-upload-id → per-backend-upload-id mapping table.
pub struct MultipartCoordinator {
    inner: RwLock<Inner>,
    ttl: Duration,
    sweeper: RwLock<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl MultipartCoordinator {
    pub fn new(ttl: Duration) -> Self {
        MultipartCoordinator {
            inner: RwLock::new(Inner {
                uploads: HashMap::new(),
                expired_swept: 0,
            }),
            ttl,
            sweeper: RwLock::new(None),
        }
    }

    /// Mint a new proxy upload id (16 random bytes, hex, `proxy-` prefixed)
    /// and register its mapping.
    pub fn create(&self, bucket: String, key: String, backend_upload_ids: std::collections::BTreeMap<String, String>) -> String {
        let bytes: [u8; 16] = rand::random();
        let proxy_upload_id = format!("proxy-{}", hex::encode(bytes));

        let mapping = MultipartMapping {
            proxy_upload_id: proxy_upload_id.clone(),
            backend_upload_ids,
            bucket,
            key,
            created_at: SystemTime::now(),
        };
        self.inner.write().uploads.insert(proxy_upload_id.clone(), mapping);
        proxy_upload_id
    }

    /// Look up a mapping, treating an expired entry as absent.
    pub fn get(&self, proxy_upload_id: &str) -> Option<MultipartMapping> {
        let inner = self.inner.read();
        let mapping = inner.uploads.get(proxy_upload_id)?;
        if self.is_expired(mapping) {
            return None;
        }
        Some(mapping.clone())
    }

    /// Remove a mapping. Idempotent: removing an unknown or already-removed
    /// id is not an error (`spec.md` §4.5 "Abort is always idempotent").
    pub fn delete(&self, proxy_upload_id: &str) {
        self.inner.write().uploads.remove(proxy_upload_id);
    }

    /// All non-expired mappings for a bucket, for ListMultipartUploads.
    pub fn list(&self, bucket: &str) -> Vec<MultipartMapping> {
        let inner = self.inner.read();
        inner
            .uploads
            .values()
            .filter(|m| m.bucket == bucket && !self.is_expired(m))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let inner = self.inner.read();
        CoordinatorStats {
            active_uploads: inner.uploads.len(),
            expired_swept: inner.expired_swept,
        }
    }

    fn is_expired(&self, mapping: &MultipartMapping) -> bool {
        mapping
            .created_at
            .elapsed()
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    fn sweep_once(&self) {
        let mut inner = self.inner.write();
        let ttl = self.ttl;
        let before = inner.uploads.len();
        inner.uploads.retain(|_, mapping| {
            mapping.created_at.elapsed().map(|age| age <= ttl).unwrap_or(true)
        });
        let removed = before - inner.uploads.len();
        if removed > 0 {
            inner.expired_swept += removed as u64;
            info!(removed, "swept expired multipart upload mappings");
        }
    }

    /// Spawn the periodic sweeper. Idempotent.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.sweeper.write();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let child_token = token.clone();
        let coordinator = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = child_token.cancelled() => break,
                    _ = ticker.tick() => coordinator.sweep_once(),
                }
            }
        });

        *guard = Some((handle, token));
    }

    pub async fn stop(&self) {
        let taken = self.sweeper.write().take();
        if let Some((handle, token)) = taken {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(%err, "multipart sweeper task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn backend_ids() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("b1".to_string(), "backend-upload-1".to_string());
        m
    }

    #[test]
    fn create_then_get_round_trips() {
        let coordinator = MultipartCoordinator::new(Duration::from_secs(3600));
        let id = coordinator.create("bucket".into(), "key".into(), backend_ids());
        assert!(id.starts_with("proxy-"));

        let mapping = coordinator.get(&id).expect("mapping present");
        assert_eq!(mapping.bucket, "bucket");
        assert_eq!(mapping.backend_upload_ids.get("b1").unwrap(), "backend-upload-1");
    }

    #[test]
    fn delete_is_idempotent_on_unknown_id() {
        let coordinator = MultipartCoordinator::new(Duration::from_secs(3600));
        coordinator.delete("proxy-does-not-exist");
        coordinator.delete("proxy-does-not-exist");
    }

    #[test]
    fn expired_mapping_is_invisible_to_get_and_list() {
        let coordinator = MultipartCoordinator::new(Duration::from_millis(1));
        let id = coordinator.create("bucket".into(), "key".into(), backend_ids());
        std::thread::sleep(Duration::from_millis(10));
        assert!(coordinator.get(&id).is_none());
        assert!(coordinator.list("bucket").is_empty());
    }

    #[test]
    fn sweep_removes_expired_entries_and_counts_them() {
        let coordinator = MultipartCoordinator::new(Duration::from_millis(1));
        coordinator.create("bucket".into(), "key".into(), backend_ids());
        std::thread::sleep(Duration::from_millis(10));
        coordinator.sweep_once();

        let stats = coordinator.stats();
        assert_eq!(stats.active_uploads, 0);
        assert_eq!(stats.expired_swept, 1);
    }

    #[test]
    fn list_filters_by_bucket() {
        let coordinator = MultipartCoordinator::new(Duration::from_secs(3600));
        coordinator.create("bucket-a".into(), "key".into(), backend_ids());
        coordinator.create("bucket-b".into(), "key".into(), backend_ids());
        assert_eq!(coordinator.list("bucket-a").len(), 1);
        assert_eq!(coordinator.list("bucket-b").len(), 1);
    }
}
