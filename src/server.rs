//! Axum router construction and S3 route mapping (`spec.md` §6 "Wire
//! protocol").
//!
//! S3 distinguishes operations by query parameters, not just path+method.
//! A single handler per method+path parses the incoming axum request into
//! the canonical [`model::Request`] and hands it to the
//! [`routing::RoutingEngine`], which is the only place operation dispatch
//! happens.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Request as HttpRequest, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response as AxumResponse},
    routing::{delete, get, head, post, put},
    Router,
};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::metrics::{metrics_handler, metrics_middleware};
use crate::model::{Operation, RequestBody, Scheme};
use crate::AppState;

/// Build the axum [`Router`] with all S3-compatible routes.
pub fn app(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(handle_get_service))
        .route("/:bucket", get(handle_get_bucket))
        .route("/:bucket", head(handle_head_bucket))
        .route("/:bucket/*key", get(handle_get_object))
        .route("/:bucket/*key", put(handle_put_object))
        .route("/:bucket/*key", delete(handle_delete_object))
        .route("/:bucket/*key", head(handle_head_object))
        .route("/:bucket/*key", post(handle_post_object))
        .with_state(state)
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http());

    router.layer(DefaultBodyLimit::disable())
}

/// Adds `Date` and `Server` to every response, the way the corpus's
/// middleware chains finish off a response before it leaves the process.
async fn common_headers_middleware(req: HttpRequest<axum::body::Body>, next: Next) -> AxumResponse {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    headers.insert("date", HeaderValue::from_str(&date).unwrap());
    headers.insert("server", HeaderValue::from_static("s3proxy"));
    response
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.registry.live_backends().is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

fn parse_query(raw: Option<String>) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Some(qs) = raw else { return map };
    for part in qs.split('&') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = match part.split_once('=') {
            Some((k, v)) => (
                percent_encoding::percent_decode_str(k).decode_utf8_lossy().into_owned(),
                percent_encoding::percent_decode_str(v).decode_utf8_lossy().into_owned(),
            ),
            None => (
                percent_encoding::percent_decode_str(part).decode_utf8_lossy().into_owned(),
                String::new(),
            ),
        };
        map.entry(k).or_default().push(v);
    }
    map
}

fn to_response(response: crate::model::Response) -> AxumResponse {
    if let Some(err) = response.error {
        return err.into_response();
    }
    let mut builder = AxumResponse::builder().status(response.status);
    for (name, value) in response.headers.iter() {
        builder = builder.header(name.clone(), value.clone());
    }
    let body = response.body.unwrap_or_default();
    builder
        .header("content-type", "application/xml")
        .body(axum::body::Body::from(body))
        .unwrap()
}

/// Wraps an axum body as a live chunk stream, never buffering it
/// (`spec.md` §3/§5). `into_data_stream()` yields a chunk as soon as it's
/// off the wire, so the replication executor's tee sees it immediately.
fn streaming_body(body: Body) -> RequestBody {
    let stream = body
        .into_data_stream()
        .map_err(|err| std::io::Error::other(err.to_string()));
    RequestBody::Streaming(Box::pin(stream))
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    operation: Operation,
    bucket: String,
    key: String,
    headers: HeaderMap,
    query: BTreeMap<String, Vec<String>>,
    body: RequestBody,
) -> crate::model::Request {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let content_length = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    crate::model::Request {
        operation,
        bucket,
        key,
        host,
        scheme: Scheme::Https,
        headers,
        query,
        body,
        content_length,
        cancellation: CancellationToken::new(),
    }
}

async fn handle_get_service(State(state): State<Arc<AppState>>, headers: HeaderMap) -> AxumResponse {
    let request = build_request(Operation::ListBuckets, String::new(), String::new(), headers, BTreeMap::new(), RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

async fn handle_get_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> AxumResponse {
    let query = parse_query(raw_query);
    let operation = if query.contains_key("uploads") {
        Operation::ListMultipartUploads
    } else {
        Operation::ListObjectsV2
    };
    let request = build_request(operation, bucket, String::new(), headers, query, RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

async fn handle_head_bucket(State(state): State<Arc<AppState>>, Path(bucket): Path<String>, headers: HeaderMap) -> AxumResponse {
    let request = build_request(Operation::HeadBucket, bucket, String::new(), headers, BTreeMap::new(), RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> AxumResponse {
    let query = parse_query(raw_query);
    let request = build_request(Operation::GetObject, bucket, key, headers, query, RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> AxumResponse {
    let query = parse_query(raw_query);
    let operation = if query.contains_key("partNumber") && query.contains_key("uploadId") {
        Operation::UploadPart
    } else {
        Operation::PutObject
    };
    let request = build_request(operation, bucket, key, headers, query, streaming_body(body));
    to_response(state.routing.handle(request).await)
}

async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> AxumResponse {
    let query = parse_query(raw_query);
    let operation = if query.contains_key("uploadId") {
        Operation::AbortMultipartUpload
    } else {
        Operation::DeleteObject
    };
    let request = build_request(operation, bucket, key, headers, query, RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> AxumResponse {
    let request = build_request(Operation::HeadObject, bucket, key, headers, BTreeMap::new(), RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    _body: Bytes,
) -> AxumResponse {
    let query = parse_query(raw_query);
    let operation = if query.contains_key("uploads") {
        Operation::CreateMultipartUpload
    } else if query.contains_key("uploadId") {
        Operation::CompleteMultipartUpload
    } else {
        Operation::Unsupported
    };
    let request = build_request(operation, bucket, key, headers, query, RequestBody::Empty);
    to_response(state.routing.handle(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_decodes_value_and_flag_params() {
        let query = parse_query(Some("prefix=a%2Fb&uploads".to_string()));
        assert_eq!(query.get("prefix").unwrap()[0], "a/b");
        assert_eq!(query.get("uploads").unwrap()[0], "");
    }

    #[test]
    fn parse_query_handles_missing_query_string() {
        let query = parse_query(None);
        assert!(query.is_empty());
    }
}
