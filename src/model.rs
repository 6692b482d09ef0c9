//! Canonical request/response records and the types they're built from.
//!
//! Everything downstream of the HTTP listener — the authenticator, the
//! executors, the routing engine — operates on these types rather than on
//! axum's `Request`/`Response` directly, so that the core dispatch logic has
//! no dependency on the web framework.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::Stream;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::ProxyError;

/// A single chunk of a request body as it arrives off the wire.
pub type BodyChunk = Result<Bytes, std::io::Error>;

/// A read-once stream of body chunks, boxed so `Request` doesn't need to be
/// generic over the concrete stream type axum hands back.
pub type BodyStream = Pin<Box<dyn Stream<Item = BodyChunk> + Send>>;

/// The S3 sub-operation a request maps to, derived from HTTP method + path +
/// query parameters by the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    PutObject,
    GetObject,
    HeadObject,
    HeadBucket,
    DeleteObject,
    ListObjectsV2,
    ListBuckets,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListMultipartUploads,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// A read-once request body (`spec.md` §3: "streaming body (read-once,
/// possibly unknown length)"). Bodies are never buffered in full by the HTTP
/// listener — `Streaming` carries the live chunk stream straight from the
/// axum body, which the Replication Executor tees across backend workers as
/// chunks arrive (see `replication::tee_body`).
pub enum RequestBody {
    Streaming(BodyStream),
    Empty,
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Consume the body into its chunk stream. `Empty` yields a stream that
    /// ends immediately.
    pub fn into_stream(self) -> BodyStream {
        match self {
            RequestBody::Streaming(s) => s,
            RequestBody::Empty => Box::pin(futures::stream::empty()),
        }
    }
}

/// The canonical internal request record (`spec.md` §3).
///
/// Invariant: `bucket` is empty iff `operation` is `ListBuckets`; `key` is
/// empty for any bucket-level operation.
pub struct Request {
    pub operation: Operation,
    pub bucket: String,
    pub key: String,
    pub host: String,
    pub scheme: Scheme,
    pub headers: HeaderMap,
    pub query: BTreeMap<String, Vec<String>>,
    pub body: RequestBody,
    pub content_length: Option<u64>,
    pub cancellation: CancellationToken,
}

impl Request {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name)?.first().map(|s| s.as_str())
    }
}

/// The canonical internal response record (`spec.md` §3).
///
/// Invariant: when `error` is set, `body` is `None` — the error formatter
/// owns body generation.
pub struct Response {
    pub status: http::StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub error: Option<ProxyError>,
}

impl Response {
    pub fn ok(status: http::StatusCode, body: Bytes) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: Some(body),
            error: None,
        }
    }

    pub fn no_body(status: http::StatusCode) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: None,
            error: None,
        }
    }

    pub fn from_error(err: ProxyError) -> Self {
        let status = err.status_code();
        Response {
            status,
            headers: HeaderMap::new(),
            body: None,
            error: Some(err),
        }
    }
}

/// Static per-backend configuration (`spec.md` §3). All fields required,
/// non-empty, validated at config-load time.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub id: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStateKind {
    Up,
    Probing,
    Down,
}

/// The mutable, lock-guarded health bookkeeping for one backend.
pub struct HealthState {
    pub state: HealthStateKind,
    pub last_error: Option<String>,
    pub last_probe: Option<SystemTime>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub recent_failures: u32,
    pub window_start: SystemTime,
}

impl HealthState {
    pub fn new(initial: HealthStateKind) -> Self {
        HealthState {
            state: initial,
            last_error: None,
            last_probe: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            recent_failures: 0,
            window_start: SystemTime::now(),
        }
    }
}

/// One configured downstream backend: immutable identity/config/client, plus
/// lock-guarded mutable health state.
///
/// Lock hierarchy: callers holding the registry's `RwLock` must never also
/// try to take this backend's `health` lock while a *different* backend's
/// health lock is held, and the registry lock must always be released (or
/// never held in the first place) before taking this lock — "registry
/// (optional) then backend, never the reverse" (`spec.md` §9).
pub struct Backend {
    pub id: String,
    pub config: BackendConfig,
    pub client: Client,
    /// Additional unsigned-payload client. The Replication Executor only
    /// selects this one for a given write when the backend's endpoint is
    /// plain HTTP *and* the inbound request didn't already supply a real
    /// `x-amz-content-sha256`; see `replication::select_client`
    /// (`spec.md` §4.3).
    pub streaming_client: Client,
    pub health: Mutex<HealthState>,
}

impl Backend {
    pub fn snapshot_state(&self) -> HealthStateKind {
        self.health.lock().state
    }
}

/// Per-backend outcome of one operation, reported to the Registry and
/// surfaced to the aggregator (`spec.md` §3).
pub struct BackendResult {
    pub backend_id: String,
    pub method: Operation,
    pub status: Option<u16>,
    pub error: Option<Arc<BackendError>>,
    pub duration: Duration,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// Classification-relevant error from a single backend call.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Context cancellation or deadline exceeded — benign.
    Cancelled,
    /// 404-class response — benign.
    NotFound,
    /// Anything else: 5xx, 403, network failure — critical.
    Critical(String),
}

impl BackendError {
    pub fn is_benign(&self) -> bool {
        matches!(self, BackendError::Cancelled | BackendError::NotFound)
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Cancelled => write!(f, "cancelled"),
            BackendError::NotFound => write!(f, "not found"),
            BackendError::Critical(msg) => write!(f, "{msg}"),
        }
    }
}

/// Maps one proxy-minted multipart upload id to its per-backend upload ids
/// (`spec.md` §3/§4.5).
#[derive(Debug, Clone)]
pub struct MultipartMapping {
    pub proxy_upload_id: String,
    pub backend_upload_ids: BTreeMap<String, String>,
    pub bucket: String,
    pub key: String,
    pub created_at: SystemTime,
}

/// Access key → secret + display name. Read-only after startup.
#[derive(Debug, Clone)]
pub struct Credential {
    pub secret_key: String,
    pub display_name: String,
}

/// Produced by the Authenticator on success.
#[derive(Debug, Clone)]
pub struct Identity {
    pub access_key: String,
    pub display_name: String,
}

/// Ack level for a replicated write (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLevel {
    None,
    One,
    All,
}

/// Read strategy for GetObject/HeadObject (`spec.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    First,
    Newest,
}

/// Client-supplied write headers translated onto the backend request
/// (`spec.md` §4.3). Not every field applies to every write operation —
/// UploadPart only honors `content_md5`/`content_sha256`, the rest are
/// CreateMultipartUpload/PutObject-only in the real S3 API.
#[derive(Debug, Clone, Default)]
pub struct WriteHeaders {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_md5: Option<String>,
    pub cache_control: Option<String>,
    pub storage_class: Option<String>,
    /// The inbound `x-amz-content-sha256`, if the client sent a real
    /// (non-`UNSIGNED-PAYLOAD`) hash. Governs which per-backend client
    /// `replication::select_client` picks.
    pub content_sha256: Option<String>,
    pub metadata: BTreeMap<String, String>,
}
