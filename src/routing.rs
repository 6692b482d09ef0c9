//! Policy & Routing Engine (`spec.md` §4.6).
//!
//! A single `handle(Request) -> Response` entry point: authenticate, dispatch
//! by `Operation` to the Replication or Fetch Executor under the configured
//! policy, and translate the result into the canonical response record.
//! Grounded on the teacher's `server.rs` dispatch shape (one match over the
//! parsed operation), retargeted to call executors instead of a single
//! storage backend.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::StatusCode;

use crate::auth;
use crate::config::Config;
use crate::errors::ProxyError;
use crate::fetch::{to_xml_upload_entries, FetchExecutor};
use crate::model::{AckLevel, Credential, Operation, ReadStrategy, Request, Response, WriteHeaders};
use crate::replication::ReplicationExecutor;
use crate::xml;

pub struct RoutingEngine {
    credentials: std::collections::HashMap<String, Credential>,
    replication: ReplicationExecutor,
    fetch: FetchExecutor,
    put_ack: AckLevel,
    delete_ack: AckLevel,
    get_strategy: ReadStrategy,
}

impl RoutingEngine {
    pub fn new(
        config: &Config,
        credentials: std::collections::HashMap<String, Credential>,
        replication: ReplicationExecutor,
        fetch: FetchExecutor,
    ) -> Self {
        RoutingEngine {
            credentials,
            replication,
            fetch,
            put_ack: parse_ack(&config.routing.policies.put.ack),
            delete_ack: parse_ack(&config.routing.policies.delete.ack),
            get_strategy: parse_strategy(&config.routing.policies.get.strategy),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        if let Err(auth_err) = auth::authenticate(&request, &self.credentials) {
            return Response::from_error(ProxyError::Auth(auth_err));
        }

        let result = self.dispatch(request).await;
        match result {
            Ok(response) => response,
            Err(err) => Response::from_error(err),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, ProxyError> {
        match request.operation {
            Operation::PutObject => self.handle_put_object(request).await,
            Operation::GetObject => self.handle_get_object(&request).await,
            Operation::HeadObject => self.handle_head_object(&request).await,
            Operation::HeadBucket => self.handle_head_bucket(&request).await,
            Operation::DeleteObject => self.handle_delete_object(&request).await,
            Operation::ListObjectsV2 => self.handle_list_objects(&request).await,
            Operation::ListBuckets => self.handle_list_buckets(),
            Operation::CreateMultipartUpload => self.handle_create_multipart_upload(&request).await,
            Operation::UploadPart => self.handle_upload_part(request).await,
            Operation::CompleteMultipartUpload => self.handle_complete_multipart_upload(&request).await,
            Operation::AbortMultipartUpload => self.handle_abort_multipart_upload(&request).await,
            Operation::ListMultipartUploads => self.handle_list_multipart_uploads(&request),
            Operation::Unsupported => Err(ProxyError::NotImplemented),
        }
    }

    async fn handle_put_object(&self, request: Request) -> Result<Response, ProxyError> {
        let headers = write_headers_from(&request.headers);
        let content_length = request.content_length;
        let etag = self
            .replication
            .put_object(&request.bucket, &request.key, request.body.into_stream(), content_length, headers, self.put_ack)
            .await?;
        let mut response = Response::no_body(StatusCode::OK);
        if let Some(etag) = etag {
            if let Ok(value) = etag.parse() {
                response.headers.insert("etag", value);
            }
        }
        Ok(response)
    }

    async fn handle_get_object(&self, request: &Request) -> Result<Response, ProxyError> {
        let object = self.fetch.get_object(&request.bucket, &request.key, self.get_strategy).await?;
        let mut response = Response::ok(StatusCode::OK, object.body);
        response.headers.insert("etag", object.etag.parse().unwrap());
        response.headers.insert("last-modified", object.last_modified.parse().unwrap());
        if let Some(ct) = object.content_type {
            response.headers.insert("content-type", ct.parse().unwrap());
        }
        Ok(response)
    }

    async fn handle_head_object(&self, request: &Request) -> Result<Response, ProxyError> {
        let object = self.fetch.head_object(&request.bucket, &request.key, self.get_strategy).await?;
        let mut response = Response::no_body(StatusCode::OK);
        response.headers.insert("etag", object.etag.parse().unwrap());
        response.headers.insert("last-modified", object.last_modified.parse().unwrap());
        response
            .headers
            .insert("content-length", object.content_length.to_string().parse().unwrap());
        Ok(response)
    }

    async fn handle_head_bucket(&self, request: &Request) -> Result<Response, ProxyError> {
        self.fetch.head_bucket(&request.bucket).await?;
        Ok(Response::no_body(StatusCode::OK))
    }

    async fn handle_delete_object(&self, request: &Request) -> Result<Response, ProxyError> {
        self.replication
            .delete_object(&request.bucket, &request.key, self.delete_ack)
            .await?;
        Ok(Response::no_body(StatusCode::NO_CONTENT))
    }

    async fn handle_list_objects(&self, request: &Request) -> Result<Response, ProxyError> {
        let prefix = request.query_param("prefix").unwrap_or("").to_string();
        let max_keys: u32 = request
            .query_param("max-keys")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);
        let token = request.query_param("continuation-token");

        let result = self.fetch.list_objects_v2(&request.bucket, &prefix, max_keys, token).await?;
        let xml_entries = result.to_xml_entries();
        let body = xml::render_list_objects_result(
            &request.bucket,
            &prefix,
            max_keys,
            result.is_truncated,
            xml_entries.len() as u32,
            &xml_entries,
            result.next_continuation_token.as_deref(),
        );
        Ok(Response::ok(StatusCode::OK, Bytes::from(body)))
    }

    fn handle_list_buckets(&self) -> Result<Response, ProxyError> {
        let buckets = self.fetch.list_buckets();
        let refs: Vec<(&str, &str)> = buckets.iter().map(|(n, d)| (n.as_str(), d.as_str())).collect();
        let body = xml::render_list_buckets_result("proxy", "s3proxy", &refs);
        Ok(Response::ok(StatusCode::OK, Bytes::from(body)))
    }

    async fn handle_create_multipart_upload(&self, request: &Request) -> Result<Response, ProxyError> {
        let upload_id = self
            .replication
            .create_multipart_upload(&request.bucket, &request.key)
            .await?;
        let body = xml::render_initiate_multipart_upload_result(&request.bucket, &request.key, &upload_id);
        Ok(Response::ok(StatusCode::OK, Bytes::from(body)))
    }

    async fn handle_upload_part(&self, request: Request) -> Result<Response, ProxyError> {
        let upload_id = request
            .query_param("uploadId")
            .ok_or_else(|| ProxyError::InvalidRequest("missing uploadId".to_string()))?
            .to_string();
        let part_number: i32 = request
            .query_param("partNumber")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProxyError::InvalidRequest("missing or invalid partNumber".to_string()))?;

        let headers = write_headers_from(&request.headers);
        let content_length = request.content_length;
        let etag = self
            .replication
            .upload_part(&upload_id, part_number, request.body.into_stream(), content_length, headers, self.put_ack)
            .await?;

        let mut response = Response::no_body(StatusCode::OK);
        if let Some(etag) = etag {
            if let Ok(value) = etag.parse() {
                response.headers.insert("etag", value);
            }
        }
        Ok(response)
    }

    async fn handle_complete_multipart_upload(&self, request: &Request) -> Result<Response, ProxyError> {
        let upload_id = request
            .query_param("uploadId")
            .ok_or_else(|| ProxyError::InvalidRequest("missing uploadId".to_string()))?;
        let etag = self.replication.complete_multipart_upload(upload_id).await?;
        let location = format!("/{}/{}", request.bucket, request.key);
        let body = xml::render_complete_multipart_upload_result(&location, &request.bucket, &request.key, &etag);
        Ok(Response::ok(StatusCode::OK, Bytes::from(body)))
    }

    async fn handle_abort_multipart_upload(&self, request: &Request) -> Result<Response, ProxyError> {
        let upload_id = request
            .query_param("uploadId")
            .ok_or_else(|| ProxyError::InvalidRequest("missing uploadId".to_string()))?;
        self.replication.abort_multipart_upload(upload_id).await?;
        Ok(Response::no_body(StatusCode::NO_CONTENT))
    }

    fn handle_list_multipart_uploads(&self, request: &Request) -> Result<Response, ProxyError> {
        let entries = self.fetch.list_multipart_uploads(&request.bucket);
        let xml_entries = to_xml_upload_entries(&entries);
        let body = xml::render_list_multipart_uploads_result(&request.bucket, &xml_entries);
        Ok(Response::ok(StatusCode::OK, Bytes::from(body)))
    }
}

/// Translate the inbound request's headers into backend-bound write
/// metadata (`spec.md` §4.3): the handful of well-known headers plus every
/// `x-amz-meta-*` header, case-insensitively, with the prefix stripped.
fn write_headers_from(headers: &http::HeaderMap) -> WriteHeaders {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    let mut metadata = BTreeMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if let Some(meta_key) = lower.strip_prefix("x-amz-meta-") {
            if let Ok(value) = value.to_str() {
                metadata.insert(meta_key.to_string(), value.to_string());
            }
        }
    }

    WriteHeaders {
        content_type: get("content-type"),
        content_encoding: get("content-encoding"),
        content_md5: get("content-md5"),
        cache_control: get("cache-control"),
        storage_class: get("x-amz-storage-class"),
        content_sha256: get("x-amz-content-sha256"),
        metadata,
    }
}

fn parse_ack(value: &str) -> AckLevel {
    match value {
        "none" => AckLevel::None,
        "all" => AckLevel::All,
        _ => AckLevel::One,
    }
}

fn parse_strategy(value: &str) -> ReadStrategy {
    match value {
        "newest" => ReadStrategy::Newest,
        _ => ReadStrategy::First,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ack_defaults_unknown_to_one() {
        assert_eq!(parse_ack("one"), AckLevel::One);
        assert_eq!(parse_ack("all"), AckLevel::All);
        assert_eq!(parse_ack("none"), AckLevel::None);
        assert_eq!(parse_ack("bogus"), AckLevel::One);
    }

    #[test]
    fn parse_strategy_defaults_unknown_to_first() {
        assert_eq!(parse_strategy("first"), ReadStrategy::First);
        assert_eq!(parse_strategy("newest"), ReadStrategy::Newest);
        assert_eq!(parse_strategy("bogus"), ReadStrategy::First);
    }
}
