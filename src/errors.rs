//! S3-compatible error types (`spec.md` §7).
//!
//! Every variant maps to a well-known S3 error code and HTTP status. The
//! enum implements [`axum::response::IntoResponse`] so the routing engine
//! can return the error directly; errors surfaced to the client are never
//! raw SDK errors, always this taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors produced by the SigV4 Authenticator (`spec.md` §4.2).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("a required security header is missing")]
    MissingHeader,
    #[error("the authorization header could not be parsed")]
    MalformedHeader,
    #[error("the access key id is not known")]
    UnknownAccessKey,
    #[error("the computed signature does not match the provided signature")]
    SignatureMismatch,
    #[error("the request timestamp is outside the allowed clock skew")]
    Expired,
}

/// The full error taxonomy surfaced to clients (`spec.md` §7).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Auth(#[from] AuthError),

    /// Unsupported / unrecognized operation.
    #[error("a header you provided implies functionality that is not implemented")]
    NotImplemented,

    /// No live backends available for this operation.
    #[error("the service is temporarily unavailable")]
    ServiceUnavailable,

    #[error("the specified bucket does not exist")]
    NoSuchBucket,

    #[error("the specified key does not exist")]
    NoSuchKey,

    #[error("the specified multipart upload does not exist")]
    NoSuchUpload,

    /// All-backend failure under `ack=all`, or any other unrecoverable
    /// aggregation failure.
    #[error("we encountered an internal error, please try again")]
    InternalError,

    /// Malformed continuation token or otherwise malformed request.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("access denied")]
    AccessDenied,
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Auth(AuthError::MissingHeader) => "MissingSecurityHeader",
            ProxyError::Auth(AuthError::MalformedHeader) => "MissingSecurityHeader",
            ProxyError::Auth(AuthError::UnknownAccessKey) => "InvalidAccessKeyId",
            ProxyError::Auth(AuthError::SignatureMismatch) => "SignatureDoesNotMatch",
            ProxyError::Auth(AuthError::Expired) => "RequestTimeTooSkewed",
            ProxyError::NotImplemented => "NotImplemented",
            ProxyError::ServiceUnavailable => "ServiceUnavailable",
            ProxyError::NoSuchBucket => "NoSuchBucket",
            ProxyError::NoSuchKey => "NoSuchKey",
            ProxyError::NoSuchUpload => "NoSuchUpload",
            ProxyError::InternalError => "InternalError",
            ProxyError::InvalidRequest(_) => "InvalidRequest",
            ProxyError::AccessDenied => "AccessDenied",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Auth(AuthError::MissingHeader) => StatusCode::BAD_REQUEST,
            ProxyError::Auth(AuthError::MalformedHeader) => StatusCode::BAD_REQUEST,
            ProxyError::Auth(AuthError::UnknownAccessKey) => StatusCode::FORBIDDEN,
            ProxyError::Auth(AuthError::SignatureMismatch) => StatusCode::FORBIDDEN,
            ProxyError::Auth(AuthError::Expired) => StatusCode::FORBIDDEN,
            ProxyError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ProxyError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::NoSuchBucket => StatusCode::NOT_FOUND,
            ProxyError::NoSuchKey => StatusCode::NOT_FOUND,
            ProxyError::NoSuchUpload => StatusCode::NOT_FOUND,
            ProxyError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::AccessDenied => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        let body = render_error(self.code(), &self.to_string(), "", &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "s3proxy".to_string()),
            ],
            body,
        )
            .into_response()
    }
}
