//! Replication Executor (`spec.md` §4.3).
//!
//! Fans writes out to every live backend and aggregates the per-backend
//! outcomes according to the operation's configured ack level. Grounded on
//! the teacher's `storage/aws.rs` client-construction pattern, generalized
//! from "one backend" to "every live backend, concurrently".
//!
//! Body fan-out: the inbound body is never buffered in full. `tee_body`
//! forwards each chunk, as it arrives, to one bounded channel per backend
//! worker; a worker that can't keep up fills its channel and makes the tee
//! task's send block, which in turn stops it pulling more chunks off the
//! client stream — the backpressure `spec.md` §5 requires. Each per-backend
//! channel receiver is wrapped as an `http_body::Body` and handed to the AWS
//! SDK as a `ByteStream`, so nothing downstream of the tee buffers the body
//! either.

use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use aws_sdk_s3::Client;
use aws_smithy_types::body::SdkBody;
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::errors::ProxyError;
use crate::metrics;
use crate::model::{AckLevel, Backend, BackendError, BackendResult, BodyChunk, BodyStream, Operation, WriteHeaders};
use crate::multipart::MultipartCoordinator;
use crate::registry::Registry;

/// One backend's outcome from a fan-out write, kept for error aggregation
/// beyond what `BackendResult` itself carries.
struct WriteOutcome {
    backend_id: String,
    error: Option<BackendError>,
    etag: Option<String>,
}

pub struct ReplicationExecutor {
    registry: Arc<Registry>,
    multipart: Arc<MultipartCoordinator>,
    operation_timeout: Duration,
    /// Bounds total in-flight backend workers across every write this
    /// executor issues (`spec.md` §5 "MaxConcurrentOperations").
    semaphore: Arc<Semaphore>,
    retry_attempts: u32,
    retry_delay: Duration,
    /// Per-backend tee channel capacity, in chunks. Reuses the
    /// `replicator.buffer_size` config key as a chunk count rather than a
    /// byte count, since the tee is chunk-bounded, not byte-bounded.
    stream_channel_capacity: usize,
}

impl ReplicationExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        multipart: Arc<MultipartCoordinator>,
        operation_timeout: Duration,
        semaphore: Arc<Semaphore>,
        retry_attempts: u32,
        retry_delay: Duration,
        stream_channel_capacity: usize,
    ) -> Self {
        ReplicationExecutor {
            registry,
            multipart,
            operation_timeout,
            semaphore,
            retry_attempts,
            retry_delay,
            stream_channel_capacity,
        }
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: BodyStream,
        content_length: Option<u64>,
        headers: WriteHeaders,
        ack: AckLevel,
    ) -> Result<Option<String>, ProxyError> {
        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        let mut receivers = tee_body(body, backends.len(), self.stream_channel_capacity);

        let tasks: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                let bucket = bucket.to_string();
                let key = key.to_string();
                let headers = headers.clone();
                let timeout = self.operation_timeout;
                let semaphore = Arc::clone(&self.semaphore);
                let rx = receivers.remove(0);
                async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                    let started = Instant::now();
                    let client = select_client(&backend, &headers);
                    let stream = ByteStream::new(SdkBody::from_body_1_x(ReceiverBody { rx }));
                    let mut request = client.put_object().bucket(&bucket).key(&key).body(stream);
                    if let Some(len) = content_length {
                        request = request.content_length(len as i64);
                    }
                    request = apply_put_headers(request, &headers);
                    let outcome = tokio::time::timeout(timeout, request.send()).await;
                    let elapsed = started.elapsed();
                    // The body is a single-consumption stream by the time we
                    // get here, so a failed attempt cannot be retried.
                    classify_write_outcome(&backend, Operation::PutObject, outcome, elapsed, content_length.unwrap_or(0))
                }
            })
            .collect();

        self.aggregate_writes(tasks, ack).await
    }

    pub async fn delete_object(&self, bucket: &str, key: &str, ack: AckLevel) -> Result<Option<String>, ProxyError> {
        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        let tasks: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                let bucket = bucket.to_string();
                let key = key.to_string();
                let timeout = self.operation_timeout;
                let semaphore = Arc::clone(&self.semaphore);
                let retry_attempts = self.retry_attempts;
                let retry_delay = self.retry_delay;
                async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");

                    let attempt = || async {
                        let started = Instant::now();
                        let outcome = tokio::time::timeout(
                            timeout,
                            backend.client.delete_object().bucket(&bucket).key(&key).send(),
                        )
                        .await;
                        let elapsed = started.elapsed();
                        classify_write_outcome(&backend, Operation::DeleteObject, outcome, elapsed, 0)
                    };

                    let mut result = attempt().await;
                    let mut tried = 0;
                    while tried < retry_attempts && result.error.is_some() {
                        tokio::time::sleep(retry_delay).await;
                        result = attempt().await;
                        tried += 1;
                    }
                    result
                }
            })
            .collect();

        self.aggregate_writes(tasks, ack).await
    }

    pub async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, ProxyError> {
        let backends = self.registry.live_backends();
        if backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        let retry_attempts = self.retry_attempts;
        let retry_delay = self.retry_delay;

        let results = futures::future::join_all(backends.into_iter().map(|backend| {
            let bucket = bucket.to_string();
            let key = key.to_string();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");

                let attempt = || async {
                    tokio::time::timeout(
                        timeout,
                        backend.client.create_multipart_upload().bucket(&bucket).key(&key).send(),
                    )
                    .await
                };

                let mut outcome = attempt().await;
                let mut tried = 0;
                while tried < retry_attempts && is_retryable_timeout_or_transient(&outcome) {
                    tokio::time::sleep(retry_delay).await;
                    outcome = attempt().await;
                    tried += 1;
                }
                (backend, outcome)
            }
        }))
        .await;

        let mut backend_upload_ids = BTreeMap::new();
        for (backend, outcome) in results {
            match outcome {
                Ok(Ok(resp)) => {
                    if let Some(upload_id) = resp.upload_id() {
                        backend_upload_ids.insert(backend.id.clone(), upload_id.to_string());
                        self.registry.report_success(&result_for(&backend, Operation::CreateMultipartUpload));
                    }
                }
                Ok(Err(err)) => {
                    let classified = classify_sdk_error(&err.to_string());
                    self.registry.report_failure(&result_for(&backend, Operation::CreateMultipartUpload), &classified);
                }
                Err(_) => {
                    self.registry
                        .report_failure(&result_for(&backend, Operation::CreateMultipartUpload), &BackendError::Cancelled);
                }
            }
        }

        if backend_upload_ids.is_empty() {
            return Err(ProxyError::InternalError);
        }

        Ok(self.multipart.create(bucket.to_string(), key.to_string(), backend_upload_ids))
    }

    pub async fn upload_part(
        &self,
        proxy_upload_id: &str,
        part_number: i32,
        body: BodyStream,
        content_length: Option<u64>,
        headers: WriteHeaders,
        ack: AckLevel,
    ) -> Result<Option<String>, ProxyError> {
        let mapping = self.multipart.get(proxy_upload_id).ok_or(ProxyError::NoSuchUpload)?;
        let mapped_backends = self.mapped_live_backends(&mapping);
        if mapped_backends.is_empty() {
            return Err(ProxyError::ServiceUnavailable);
        }

        let mut receivers = tee_body(body, mapped_backends.len(), self.stream_channel_capacity);

        let tasks: Vec<_> = mapped_backends
            .into_iter()
            .map(|(backend, upload_id)| {
                let bucket = mapping.bucket.clone();
                let key = mapping.key.clone();
                let headers = headers.clone();
                let timeout = self.operation_timeout;
                let semaphore = Arc::clone(&self.semaphore);
                let rx = receivers.remove(0);
                async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                    let started = Instant::now();
                    let client = select_client(&backend, &headers);
                    let stream = ByteStream::new(SdkBody::from_body_1_x(ReceiverBody { rx }));
                    let mut request = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(stream);
                    if let Some(len) = content_length {
                        request = request.content_length(len as i64);
                    }
                    request = apply_upload_part_headers(request, &headers);
                    let outcome = tokio::time::timeout(timeout, request.send()).await;
                    let elapsed = started.elapsed();
                    classify_write_outcome(&backend, Operation::UploadPart, outcome, elapsed, content_length.unwrap_or(0))
                }
            })
            .collect();

        self.aggregate_writes(tasks, ack).await
    }

    pub async fn complete_multipart_upload(&self, proxy_upload_id: &str) -> Result<String, ProxyError> {
        let mapping = self.multipart.get(proxy_upload_id).ok_or(ProxyError::NoSuchUpload)?;
        let mapped_backends = self.mapped_live_backends(&mapping);

        let retry_attempts = self.retry_attempts;
        let retry_delay = self.retry_delay;

        let results = futures::future::join_all(mapped_backends.into_iter().map(|(backend, upload_id)| {
            let bucket = mapping.bucket.clone();
            let key = mapping.key.clone();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");

                let attempt = || async {
                    tokio::time::timeout(
                        timeout,
                        backend
                            .client
                            .complete_multipart_upload()
                            .bucket(&bucket)
                            .key(&key)
                            .upload_id(&upload_id)
                            .send(),
                    )
                    .await
                };

                let mut outcome = attempt().await;
                let mut tried = 0;
                while tried < retry_attempts && is_retryable_timeout_or_transient(&outcome) {
                    tokio::time::sleep(retry_delay).await;
                    outcome = attempt().await;
                    tried += 1;
                }
                (backend, outcome)
            }
        }))
        .await;

        let mut etag = None;
        let mut any_success = false;
        for (backend, outcome) in results {
            match outcome {
                Ok(Ok(resp)) => {
                    any_success = true;
                    if etag.is_none() {
                        etag = resp.e_tag().map(|s| s.to_string());
                    }
                    self.registry.report_success(&result_for(&backend, Operation::CompleteMultipartUpload));
                }
                Ok(Err(err)) => {
                    let classified = classify_sdk_error(&err.to_string());
                    self.registry
                        .report_failure(&result_for(&backend, Operation::CompleteMultipartUpload), &classified);
                }
                Err(_) => {
                    self.registry
                        .report_failure(&result_for(&backend, Operation::CompleteMultipartUpload), &BackendError::Cancelled);
                }
            }
        }

        if !any_success {
            return Err(ProxyError::InternalError);
        }

        self.multipart.delete(proxy_upload_id);
        Ok(etag.unwrap_or_default())
    }

    /// Idempotent: aborting an unknown upload id still returns success
    /// (`spec.md` §4.5). Unlike UploadPart/CompleteMultipartUpload, Abort
    /// targets every mapped backend regardless of current liveness.
    pub async fn abort_multipart_upload(&self, proxy_upload_id: &str) -> Result<(), ProxyError> {
        let Some(mapping) = self.multipart.get(proxy_upload_id) else {
            return Ok(());
        };
        let backends = self.registry.all_backends();

        let tasks = backends.into_iter().filter_map(|backend| {
            let upload_id = mapping.backend_upload_ids.get(&backend.id)?.clone();
            let bucket = mapping.bucket.clone();
            let key = mapping.key.clone();
            let timeout = self.operation_timeout;
            let semaphore = Arc::clone(&self.semaphore);
            Some(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let _ = tokio::time::timeout(
                    timeout,
                    backend
                        .client
                        .abort_multipart_upload()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .send(),
                )
                .await;
            })
        });
        futures::future::join_all(tasks).await;

        self.multipart.delete(proxy_upload_id);
        Ok(())
    }

    /// `spec.md` §4.3: "UploadPart and CompleteMultipartUpload look up the
    /// mapping, filter the current live-backends to those present in the
    /// mapping". Returns each mapped backend still live, paired with its
    /// backend-local upload id.
    fn mapped_live_backends(&self, mapping: &crate::model::MultipartMapping) -> Vec<(Arc<Backend>, String)> {
        let live_ids: HashSet<String> = self.registry.live_backends().into_iter().map(|b| b.id).collect();
        mapping
            .backend_upload_ids
            .iter()
            .filter(|(id, _)| live_ids.contains(*id))
            .filter_map(|(id, upload_id)| Some((self.registry.lookup(id)?, upload_id.clone())))
            .collect()
    }

    /// Aggregate a set of concurrent per-backend write futures according to
    /// the configured ack level (`spec.md` §4.3 "Ack levels"). Returns the
    /// first successful worker's ETag, if any is known yet.
    async fn aggregate_writes<F>(&self, tasks: Vec<F>, ack: AckLevel) -> Result<Option<String>, ProxyError>
    where
        F: std::future::Future<Output = WriteOutcome> + Send + 'static,
    {
        match ack {
            AckLevel::None => {
                for task in tasks {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        let outcome = task.await;
                        report_outcome(&registry, &outcome);
                    });
                }
                Ok(None)
            }
            AckLevel::One => {
                let mut handles: Vec<_> = tasks.into_iter().map(tokio::spawn).collect();
                let mut last_error = None;
                while !handles.is_empty() {
                    let (result, _index, remaining) = futures::future::select_all(handles).await;
                    handles = remaining;
                    match result {
                        Ok(outcome) => {
                            let succeeded = outcome.error.is_none();
                            report_outcome(&self.registry, &outcome);
                            if succeeded {
                                let etag = outcome.etag.clone();
                                let registry = Arc::clone(&self.registry);
                                tokio::spawn(async move {
                                    futures::future::join_all(handles.into_iter().map(|h| async move {
                                        if let Ok(outcome) = h.await {
                                            report_outcome(&registry, &outcome);
                                        }
                                    }))
                                    .await;
                                });
                                return Ok(etag);
                            }
                            last_error = Some(outcome);
                        }
                        Err(err) => {
                            warn!(%err, "write task panicked");
                        }
                    }
                }
                let _ = last_error;
                Err(ProxyError::InternalError)
            }
            AckLevel::All => {
                let outcomes = futures::future::join_all(tasks).await;
                let mut all_ok = true;
                let mut etag = None;
                for outcome in &outcomes {
                    report_outcome(&self.registry, outcome);
                    if outcome.error.is_some() {
                        all_ok = false;
                    } else if etag.is_none() {
                        etag = outcome.etag.clone();
                    }
                }
                if all_ok {
                    Ok(etag)
                } else {
                    Err(ProxyError::InternalError)
                }
            }
        }
    }
}

/// Adapts a per-backend tee receiver into the `http_body::Body` the AWS SDK
/// needs to build a `ByteStream`.
struct ReceiverBody {
    rx: mpsc::Receiver<BodyChunk>,
}

impl http_body::Body for ReceiverBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(http_body::Frame::data(bytes)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Tee a single inbound body stream across `n` backend workers via bounded
/// channels: a full channel makes this task's `send` await, which in turn
/// stops it pulling the next chunk off `source` (`spec.md` §4.3/§5
/// backpressure).
fn tee_body(source: BodyStream, n: usize, capacity: usize) -> Vec<mpsc::Receiver<BodyChunk>> {
    let mut senders = Vec::with_capacity(n);
    let mut receivers = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.push(tx);
        receivers.push(rx);
    }

    tokio::spawn(async move {
        let mut source = source;
        let mut senders = senders;
        while let Some(chunk) = source.next().await {
            let mut alive = Vec::with_capacity(senders.len());
            match chunk {
                Ok(bytes) => {
                    for tx in senders {
                        if tx.send(Ok(bytes.clone())).await.is_ok() {
                            alive.push(tx);
                        }
                    }
                }
                Err(err) => {
                    for tx in senders {
                        let _ = tx.send(Err(std::io::Error::new(err.kind(), err.to_string()))).await;
                    }
                }
            }
            senders = alive;
            if senders.is_empty() {
                break;
            }
        }
    });

    receivers
}

/// Picks the unsigned streaming client only for plain-HTTP backends whose
/// inbound request didn't already carry a real `x-amz-content-sha256`
/// (`spec.md` §4.3, `SPEC_FULL.md` §9 item 3). HTTPS backends, and any
/// request the client already hashed, go through the normal signed client.
fn select_client<'b>(backend: &'b Backend, headers: &WriteHeaders) -> &'b Client {
    let is_http = backend.config.endpoint.starts_with("http://");
    let provided_real_hash = headers
        .content_sha256
        .as_deref()
        .map(|v| v != "UNSIGNED-PAYLOAD")
        .unwrap_or(false);
    if is_http && !provided_real_hash {
        &backend.streaming_client
    } else {
        &backend.client
    }
}

fn apply_put_headers(
    mut request: aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder,
    headers: &WriteHeaders,
) -> aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder {
    if let Some(v) = &headers.content_type {
        request = request.content_type(v);
    }
    if let Some(v) = &headers.content_encoding {
        request = request.content_encoding(v);
    }
    if let Some(v) = &headers.content_md5 {
        request = request.content_md5(v);
    }
    if let Some(v) = &headers.cache_control {
        request = request.cache_control(v);
    }
    if let Some(v) = &headers.storage_class {
        request = request.storage_class(aws_sdk_s3::types::StorageClass::from(v.as_str()));
    }
    for (k, v) in &headers.metadata {
        request = request.metadata(k, v);
    }
    request
}

fn apply_upload_part_headers(
    mut request: aws_sdk_s3::operation::upload_part::builders::UploadPartFluentBuilder,
    headers: &WriteHeaders,
) -> aws_sdk_s3::operation::upload_part::builders::UploadPartFluentBuilder {
    if let Some(v) = &headers.content_md5 {
        request = request.content_md5(v);
    }
    request
}

fn report_outcome(registry: &Registry, outcome: &WriteOutcome) {
    let result = BackendResult {
        backend_id: outcome.backend_id.clone(),
        method: Operation::PutObject,
        status: None,
        error: outcome.error.clone().map(Arc::new),
        duration: Duration::ZERO,
        bytes_written: 0,
        bytes_read: 0,
    };
    match &outcome.error {
        Some(error) => registry.report_failure(&result, error),
        None => registry.report_success(&result),
    }
}

fn result_for(backend: &Backend, method: Operation) -> BackendResult {
    BackendResult {
        backend_id: backend.id.clone(),
        method,
        status: None,
        error: None,
        duration: Duration::ZERO,
        bytes_written: 0,
        bytes_read: 0,
    }
}

/// Retry-worthy outcomes: a deadline miss, or any non-success SDK response.
/// Both `create_multipart_upload` and `complete_multipart_upload` have no
/// body to worry about re-sending, so any failure is safe to retry.
fn is_retryable_timeout_or_transient<T, E>(outcome: &Result<Result<T, E>, tokio::time::error::Elapsed>) -> bool {
    !matches!(outcome, Ok(Ok(_)))
}

fn classify_write_outcome<T, E: std::fmt::Display>(
    backend: &Backend,
    operation: Operation,
    outcome: Result<Result<T, E>, tokio::time::error::Elapsed>,
    elapsed: Duration,
    bytes_written: u64,
) -> WriteOutcome
where
    T: HasETag,
{
    match outcome {
        Ok(Ok(resp)) => {
            metrics::record_backend_operation(&backend.id, operation, "success", elapsed.as_secs_f64(), 0, bytes_written);
            WriteOutcome {
                backend_id: backend.id.clone(),
                error: None,
                etag: resp.etag(),
            }
        }
        Ok(Err(err)) => {
            let classified = classify_sdk_error(&err.to_string());
            metrics::record_backend_operation(&backend.id, operation, "error", elapsed.as_secs_f64(), 0, 0);
            WriteOutcome {
                backend_id: backend.id.clone(),
                error: Some(classified),
                etag: None,
            }
        }
        Err(_) => {
            metrics::record_backend_operation(&backend.id, operation, "timeout", elapsed.as_secs_f64(), 0, 0);
            WriteOutcome {
                backend_id: backend.id.clone(),
                error: Some(BackendError::Cancelled),
                etag: None,
            }
        }
    }
}

/// Lets `classify_write_outcome` stay generic over PutObject/UploadPart
/// response types while still recovering the real ETag for each.
trait HasETag {
    fn etag(&self) -> Option<String>;
}

impl HasETag for aws_sdk_s3::operation::put_object::PutObjectOutput {
    fn etag(&self) -> Option<String> {
        self.e_tag().map(|s| s.to_string())
    }
}

impl HasETag for aws_sdk_s3::operation::upload_part::UploadPartOutput {
    fn etag(&self) -> Option<String> {
        self.e_tag().map(|s| s.to_string())
    }
}

impl HasETag for aws_sdk_s3::operation::delete_object::DeleteObjectOutput {
    fn etag(&self) -> Option<String> {
        None
    }
}

/// Classify an SDK error string as benign (404-class) or critical
/// (`spec.md` §4.1 "Passive feedback").
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
    fn classify_sdk_error_treats_not_found_as_benign() {
        assert!(classify_sdk_error("NoSuchKey: the key does not exist").is_benign());
        assert!(classify_sdk_error("service returned 404").is_benign());
    }

    #[test]
    fn classify_sdk_error_treats_everything_else_as_critical() {
        assert!(!classify_sdk_error("internal server error").is_benign());
        assert!(!classify_sdk_error("access denied").is_benign());
    }
}
