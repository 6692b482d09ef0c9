//! Fetch Executor (`spec.md` §4.4).
//!
//! Serves reads (GetObject, HeadObject, HeadBucket, ListObjectsV2,
//! ListBuckets, ListMultipartUploads) from live backends according to the
//! configured read strategy, merging results across backends where the
//! operation is bucket/prefix-scoped rather than single-object.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};

use crate::cache::ObjectCache;
use crate::errors::ProxyError;
use crate::metrics;
use crate::model::{BackendError, BackendResult, Operation, ReadStrategy};
use crate::multipart::MultipartCoordinator;
use crate::registry::Registry;
use crate::xml::{ObjectEntry, UploadEntry};

/// A fetched object's bytes plus the metadata needed to render a response.
pub struct FetchedObject {
    pub body: Bytes,
    pub etag: String,
    pub last_modified: String,
    pub content_length: u64,
    pub content_type: Option<String>,
}

pub struct FetchExecutor {
    registry: Arc<Registry>,
    multipart: Arc<MultipartCoordinator>,
    cache: Arc<dyn ObjectCache>,
    operation_timeout: Duration,
    virtual_bucket: String,
    semaphore: Arc<Semaphore>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl FetchExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        multipart: Arc<MultipartCoordinator>,
        cache: Arc<dyn ObjectCache>,
        operation_timeout: Duration,
        virtual_bucket: String,
        semaphore: Arc<Semaphore>,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        FetchExecutor {
            registry,
            multipart,
            cache,
            operation_timeout,
            virtual_bucket,
            semaphore,
            retry_attempts,
            retry_delay,
        }
    }

    /// GetObject under the configured strategy (`spec.md` §4.4: "first" or
    /// "newest"). "First" races every live backend over a bounded channel
    /// and returns as soon as one succeeds; the rest keep running in the
    /// background so their outcomes still feed the health supervisor.
    /// "Newest" has to see every backend's response before it can pick, so
    /// it still waits for the whole fan-out.
    pub async fn get_object(&self, bucket: &str, key: &str, strategy: ReadStrategy) -> Result<FetchedObject, ProxyError> {
        if let Some(cached) = self.cache.get(bucket, key) {
            return Ok(FetchedObject {
                body: cached.body,
                etag: cached.etag,
                last_modified: cached.last_modified,
                content_length: 0,
                content_type: None,
            });
        }

        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        match strategy {
            ReadStrategy::First => self.get_object_race(&backends, bucket, key).await,
            ReadStrategy::Newest => self.get_object_newest(&backends, bucket, key).await,
        }
    }

    async fn get_object_race(
        &self,
        backends: &[Arc<crate::model::Backend>],
        bucket: &str,
        key: &str,
    ) -> Result<FetchedObject, ProxyError> {
        let (tx, mut rx) = mpsc::channel(backends.len().max(1));

        for backend in backends {
            let backend = Arc::clone(backend);
            let bucket = bucket.to_string();
            let key = key.to_string();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            let registry = Arc::clone(&self.registry);
            let retry_attempts = self.retry_attempts;
            let retry_delay = self.retry_delay;
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = fetch_one(&registry, &backend, &bucket, &key, timeout, retry_attempts, retry_delay).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        while let Some(result) = rx.recv().await {
            if let Some(object) = result {
                return Ok(object);
            }
        }
        Err(ProxyError::NoSuchKey)
    }

    async fn get_object_newest(
        &self,
        backends: &[Arc<crate::model::Backend>],
        bucket: &str,
        key: &str,
    ) -> Result<FetchedObject, ProxyError> {
        let candidates = futures::future::join_all(backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            let bucket = bucket.to_string();
            let key = key.to_string();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            let registry = Arc::clone(&self.registry);
            let retry_attempts = self.retry_attempts;
            let retry_delay = self.retry_delay;
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                fetch_one(&registry, &backend, &bucket, &key, timeout, retry_attempts, retry_delay).await
            }
        }))
        .await;

        let mut found: Vec<FetchedObject> = candidates.into_iter().flatten().collect();
        if found.is_empty() {
            return Err(ProxyError::NoSuchKey);
        }
        found.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(found.remove(0))
    }

    /// HeadObject: its own dedicated SDK call (no body fetched/discarded),
    /// following the same strategy/race shape as GetObject.
    pub async fn head_object(&self, bucket: &str, key: &str, strategy: ReadStrategy) -> Result<FetchedObject, ProxyError> {
        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        match strategy {
            ReadStrategy::First => self.head_object_race(&backends, bucket, key).await,
            ReadStrategy::Newest => self.head_object_newest(&backends, bucket, key).await,
        }
    }

    async fn head_object_race(
        &self,
        backends: &[Arc<crate::model::Backend>],
        bucket: &str,
        key: &str,
    ) -> Result<FetchedObject, ProxyError> {
        let (tx, mut rx) = mpsc::channel(backends.len().max(1));

        for backend in backends {
            let backend = Arc::clone(backend);
            let bucket = bucket.to_string();
            let key = key.to_string();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            let registry = Arc::clone(&self.registry);
            let retry_attempts = self.retry_attempts;
            let retry_delay = self.retry_delay;
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = head_one(&registry, &backend, &bucket, &key, timeout, retry_attempts, retry_delay).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        while let Some(result) = rx.recv().await {
            if let Some(object) = result {
                return Ok(object);
            }
        }
        Err(ProxyError::NoSuchKey)
    }

    async fn head_object_newest(
        &self,
        backends: &[Arc<crate::model::Backend>],
        bucket: &str,
        key: &str,
    ) -> Result<FetchedObject, ProxyError> {
        let candidates = futures::future::join_all(backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            let bucket = bucket.to_string();
            let key = key.to_string();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            let registry = Arc::clone(&self.registry);
            let retry_attempts = self.retry_attempts;
            let retry_delay = self.retry_delay;
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                head_one(&registry, &backend, &bucket, &key, timeout, retry_attempts, retry_delay).await
            }
        }))
        .await;

        let mut found: Vec<FetchedObject> = candidates.into_iter().flatten().collect();
        if found.is_empty() {
            return Err(ProxyError::NoSuchKey);
        }
        found.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(found.remove(0))
    }

    /// HeadBucket under "first" strategy (`spec.md` §4.4): races every live
    /// backend concurrently rather than probing them one at a time.
    pub async fn head_bucket(&self, bucket: &str) -> Result<(), ProxyError> {
        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        let (tx, mut rx) = mpsc::channel(backends.len().max(1));

        for backend in backends {
            let bucket = bucket.to_string();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            let registry = Arc::clone(&self.registry);
            let retry_attempts = self.retry_attempts;
            let retry_delay = self.retry_delay;
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");

                let attempt = || async {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(
                        timeout,
                        backend.client.head_bucket().bucket(&bucket).send(),
                    )
                    .await;
                    let elapsed = started.elapsed();
                    (outcome, elapsed)
                };

                let (mut outcome, mut elapsed) = attempt().await;
                let mut tried = 0;
                while tried < retry_attempts && !matches!(outcome, Ok(Ok(_))) {
                    tokio::time::sleep(retry_delay).await;
                    let next = attempt().await;
                    outcome = next.0;
                    elapsed = next.1;
                    tried += 1;
                }

                let success = match &outcome {
                    Ok(Ok(_)) => {
                        metrics::record_backend_operation(&backend.id, Operation::HeadBucket, "success", elapsed.as_secs_f64(), 0, 0);
                        registry.report_success(&result_for(&backend.id, Operation::HeadBucket));
                        true
                    }
                    Ok(Err(err)) => {
                        let classified = classify_sdk_error(&err.to_string());
                        metrics::record_backend_operation(&backend.id, Operation::HeadBucket, "error", elapsed.as_secs_f64(), 0, 0);
                        registry.report_failure(&result_for(&backend.id, Operation::HeadBucket), &classified);
                        false
                    }
                    Err(_) => {
                        metrics::record_backend_operation(&backend.id, Operation::HeadBucket, "timeout", elapsed.as_secs_f64(), 0, 0);
                        registry.report_failure(&result_for(&backend.id, Operation::HeadBucket), &BackendError::Cancelled);
                        false
                    }
                };
                let _ = tx.send(success).await;
            });
        }
        drop(tx);

        while let Some(success) = rx.recv().await {
            if success {
                return Ok(());
            }
        }
        Err(ProxyError::NoSuchBucket)
    }

    /// ListObjectsV2, merged across every live backend (`spec.md` §4.4
    /// "Cross-backend LIST merge"): group by key, keep the entry with the
    /// greatest LastModified.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: u32,
        continuation_token: Option<&str>,
    ) -> Result<ListObjectsResult, ProxyError> {
        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        let per_backend_tokens = decode_continuation_token(continuation_token)?;

        let pages = futures::future::join_all(backends.into_iter().map(|backend| {
            let bucket = bucket.to_string();
            let prefix = prefix.to_string();
            let token = per_backend_tokens.get(&backend.id).cloned();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            let retry_attempts = self.retry_attempts;
            let retry_delay = self.retry_delay;
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");

                let attempt = || async {
                    let mut request = backend
                        .client
                        .list_objects_v2()
                        .bucket(&bucket)
                        .prefix(&prefix)
                        .max_keys(max_keys as i32);
                    if let Some(token) = token.clone() {
                        request = request.continuation_token(token);
                    }
                    tokio::time::timeout(timeout, request.send()).await
                };

                let mut outcome = attempt().await;
                let mut tried = 0;
                while tried < retry_attempts && !matches!(outcome, Ok(Ok(_))) {
                    tokio::time::sleep(retry_delay).await;
                    outcome = attempt().await;
                    tried += 1;
                }
                (backend.id.clone(), outcome)
            }
        }))
        .await;

        let mut merged: BTreeMap<String, MergedObject> = BTreeMap::new();
        let mut next_tokens: BTreeMap<String, String> = BTreeMap::new();

        for (backend_id, outcome) in pages {
            match outcome {
                Ok(Ok(resp)) => {
                    self.registry
                        .report_success(&result_for(&backend_id, Operation::ListObjectsV2));
                    if let Some(token) = resp.next_continuation_token() {
                        next_tokens.insert(backend_id.clone(), token.to_string());
                    }
                    for obj in resp.contents() {
                        let key = obj.key().unwrap_or_default().to_string();
                        let last_modified = obj
                            .last_modified()
                            .map(|d| d.fmt(aws_smithy_types::date_time::Format::DateTime).unwrap_or_default())
                            .unwrap_or_default();
                        let entry = MergedObject {
                            last_modified: last_modified.clone(),
                            etag: obj.e_tag().unwrap_or_default().to_string(),
                            size: obj.size().unwrap_or_default().max(0) as u64,
                        };
                        merged
                            .entry(key)
                            .and_modify(|existing| {
                                if entry.last_modified > existing.last_modified {
                                    *existing = entry.clone();
                                }
                            })
                            .or_insert(entry);
                    }
                }
                Ok(Err(err)) => {
                    let classified = classify_sdk_error(&err.to_string());
                    self.registry
                        .report_failure(&result_for(&backend_id, Operation::ListObjectsV2), &classified);
                }
                Err(_) => {
                    self.registry
                        .report_failure(&result_for(&backend_id, Operation::ListObjectsV2), &BackendError::Cancelled);
                }
            }
        }

        let is_truncated = !next_tokens.is_empty();
        let next_continuation_token = if is_truncated {
            Some(encode_continuation_token(&next_tokens))
        } else {
            None
        };

        Ok(ListObjectsResult {
            entries: merged
                .into_iter()
                .map(|(key, obj)| MergedEntry {
                    key,
                    last_modified: obj.last_modified,
                    etag: obj.etag,
                    size: obj.size,
                })
                .collect(),
            is_truncated,
            next_continuation_token,
        })
    }

    /// ListBuckets always reports exactly one synthetic virtual bucket
    /// (`spec.md` §4.4).
    pub fn list_buckets(&self) -> Vec<(String, String)> {
        vec![(self.virtual_bucket.clone(), "1970-01-01T00:00:00.000Z".to_string())]
    }

    /// ListMultipartUploads, merged from the coordinator's table. Always a
    /// single page (Open Question resolution, `SPEC_FULL.md` §9).
    pub fn list_multipart_uploads(&self, bucket: &str) -> Vec<(String, String, String)> {
        self.multipart
            .list(bucket)
            .into_iter()
            .map(|m| {
                let initiated = httpdate::fmt_http_date(m.created_at);
                (m.key, m.proxy_upload_id, initiated)
            })
            .collect()
    }
}

/// One backend's GetObject attempt, with retry on any failure (the response
/// hasn't been streamed to the client yet, so a retry is always safe here).
async fn fetch_one(
    registry: &Registry,
    backend: &crate::model::Backend,
    bucket: &str,
    key: &str,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
) -> Option<FetchedObject> {
    let attempt = || async {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, backend.client.get_object().bucket(bucket).key(key).send()).await;
        (outcome, started.elapsed())
    };

    let (mut outcome, mut elapsed) = attempt().await;
    let mut tried = 0;
    while tried < retry_attempts && !matches!(outcome, Ok(Ok(_))) {
        tokio::time::sleep(retry_delay).await;
        let next = attempt().await;
        outcome = next.0;
        elapsed = next.1;
        tried += 1;
    }

    match outcome {
        Ok(Ok(resp)) => {
            let last_modified = resp
                .last_modified()
                .map(|d| d.fmt(aws_smithy_types::date_time::Format::DateTime).unwrap_or_default())
                .unwrap_or_default();
            let etag = resp.e_tag().unwrap_or_default().to_string();
            let content_type = resp.content_type().map(|s| s.to_string());
            let body = resp.body.collect().await.map(|d| d.into_bytes()).unwrap_or_default();
            registry.report_success(&result_for(&backend.id, Operation::GetObject));
            metrics::record_backend_operation(&backend.id, Operation::GetObject, "success", elapsed.as_secs_f64(), body.len() as u64, 0);
            Some(FetchedObject {
                content_length: body.len() as u64,
                body,
                etag,
                last_modified,
                content_type,
            })
        }
        Ok(Err(err)) => {
            let classified = classify_sdk_error(&err.to_string());
            metrics::record_backend_operation(&backend.id, Operation::GetObject, "error", elapsed.as_secs_f64(), 0, 0);
            registry.report_failure(&result_for(&backend.id, Operation::GetObject), &classified);
            None
        }
        Err(_) => {
            metrics::record_backend_operation(&backend.id, Operation::GetObject, "timeout", elapsed.as_secs_f64(), 0, 0);
            registry.report_failure(&result_for(&backend.id, Operation::GetObject), &BackendError::Cancelled);
            None
        }
    }
}

/// One backend's dedicated HeadObject attempt.
async fn head_one(
    registry: &Registry,
    backend: &crate::model::Backend,
    bucket: &str,
    key: &str,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
) -> Option<FetchedObject> {
    let attempt = || async {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, backend.client.head_object().bucket(bucket).key(key).send()).await;
        (outcome, started.elapsed())
    };

    let (mut outcome, mut elapsed) = attempt().await;
    let mut tried = 0;
    while tried < retry_attempts && !matches!(outcome, Ok(Ok(_))) {
        tokio::time::sleep(retry_delay).await;
        let next = attempt().await;
        outcome = next.0;
        elapsed = next.1;
        tried += 1;
    }

    match outcome {
        Ok(Ok(resp)) => {
            let last_modified = resp
                .last_modified()
                .map(|d| d.fmt(aws_smithy_types::date_time::Format::DateTime).unwrap_or_default())
                .unwrap_or_default();
            let etag = resp.e_tag().unwrap_or_default().to_string();
            let content_type = resp.content_type().map(|s| s.to_string());
            let content_length = resp.content_length().unwrap_or_default().max(0) as u64;
            registry.report_success(&result_for(&backend.id, Operation::HeadObject));
            metrics::record_backend_operation(&backend.id, Operation::HeadObject, "success", elapsed.as_secs_f64(), 0, 0);
            Some(FetchedObject {
                body: Bytes::new(),
                etag,
                last_modified,
                content_length,
                content_type,
            })
        }
        Ok(Err(err)) => {
            let classified = classify_sdk_error(&err.to_string());
            metrics::record_backend_operation(&backend.id, Operation::HeadObject, "error", elapsed.as_secs_f64(), 0, 0);
            registry.report_failure(&result_for(&backend.id, Operation::HeadObject), &classified);
            None
        }
        Err(_) => {
            metrics::record_backend_operation(&backend.id, Operation::HeadObject, "timeout", elapsed.as_secs_f64(), 0, 0);
            registry.report_failure(&result_for(&backend.id, Operation::HeadObject), &BackendError::Cancelled);
            None
        }
    }
}

#[derive(Clone)]
struct MergedObject {
    last_modified: String,
    etag: String,
    size: u64,
}

pub struct MergedEntry {
    pub key: String,
    pub last_modified: String,
    pub etag: String,
    pub size: u64,
}

pub struct ListObjectsResult {
    pub entries: Vec<MergedEntry>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

impl ListObjectsResult {
    pub fn to_xml_entries(&self) -> Vec<ObjectEntry<'_>> {
        self.entries
            .iter()
            .map(|e| ObjectEntry {
                key: &e.key,
                last_modified: &e.last_modified,
                etag: &e.etag,
                size: e.size,
                storage_class: "STANDARD",
            })
            .collect()
    }
}

pub fn to_xml_upload_entries(entries: &[(String, String, String)]) -> Vec<UploadEntry<'_>> {
    entries
        .iter()
        .map(|(key, upload_id, initiated)| UploadEntry {
            key,
            upload_id,
            initiated,
        })
        .collect()
}

/// Continuation-token codec: `base64(json({backend_id: token}))`
/// (`spec.md` §4.4).
#[derive(Serialize, Deserialize, Default)]
struct ContinuationPayload(BTreeMap<String, String>);

fn decode_continuation_token(token: Option<&str>) -> Result<BTreeMap<String, String>, ProxyError> {
    let Some(token) = token else {
        return Ok(BTreeMap::new());
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|_| ProxyError::InvalidRequest("malformed continuation token".to_string()))?;
    let payload: ContinuationPayload = serde_json::from_slice(&decoded)
        .map_err(|_| ProxyError::InvalidRequest("malformed continuation token".to_string()))?;
    Ok(payload.0)
}

fn encode_continuation_token(tokens: &BTreeMap<String, String>) -> String {
    let payload = ContinuationPayload(tokens.clone());
    let json = serde_json::to_vec(&payload).expect("continuation payload always serializes");
    base64::engine::general_purpose::STANDARD.encode(json)
}

fn result_for(backend_id: &str, method: Operation) -> BackendResult {
    BackendResult {
        backend_id: backend_id.to_string(),
        method,
        status: None,
        error: None,
        duration: Duration::ZERO,
        bytes_written: 0,
        bytes_read: 0,
    }
}

fn classify_sdk_error(message: &str) -> BackendError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("nosuchkey") || lower.contains("nosuchbucket") || lower.contains("404") || lower.contains("not found") {
        BackendError::NotFound
    } else {
        BackendError::Critical(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_token_round_trips() {
        let mut tokens = BTreeMap::new();
        tokens.insert("b1".to_string(), "tok1".to_string());
        tokens.insert("b2".to_string(), "tok2".to_string());

        let encoded = encode_continuation_token(&tokens);
        let decoded = decode_continuation_token(Some(&encoded)).unwrap();
        assert_eq!(decoded, tokens);
    }

    #[test]
    fn missing_continuation_token_decodes_to_empty_map() {
        let decoded = decode_continuation_token(None).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn malformed_continuation_token_is_rejected() {
        assert!(decode_continuation_token(Some("not-valid-base64!!")).is_err());
    }
}
