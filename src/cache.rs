//! Object cache seam (`spec.md` §4.4 Non-goals: "a working cache
//! implementation is out of scope").
//!
//! The Fetch Executor consults a cache before fanning a GetObject/HeadObject
//! out to backends. This module defines only the trait the executor is
//! written against plus a no-op implementation; a real cache (local LRU,
//! memcached, etc.) can be swapped in later without touching the executor.

use bytes::Bytes;

/// An immutable snapshot of a cached object, keyed by bucket+key.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub etag: String,
    pub last_modified: String,
    pub body: Bytes,
}

/// Cache lookup/population seam for GetObject/HeadObject.
pub trait ObjectCache: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> Option<CachedObject>;
    fn put(&self, bucket: &str, key: &str, object: CachedObject);
    fn invalidate(&self, bucket: &str, key: &str);
}

/// Always misses, never stores. The default until a real cache is wired in.
pub struct NoopCache;

impl ObjectCache for NoopCache {
    fn get(&self, _bucket: &str, _key: &str) -> Option<CachedObject> {
        None
    }

    fn put(&self, _bucket: &str, _key: &str, _object: CachedObject) {}

    fn invalidate(&self, _bucket: &str, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_cache_never_returns_a_hit() {
        let cache = NoopCache;
        cache.put(
            "bucket",
            "key",
            CachedObject {
                etag: "\"x\"".into(),
                last_modified: "2026-01-01T00:00:00.000Z".into(),
                body: Bytes::from_static(b"data"),
            },
        );
        assert!(cache.get("bucket", "key").is_none());
    }
}
