//! Versioned HTTP API
//!
//! - `version`: resolves the API version of each request
//! - `deprecation`: Deprecation / Sunset / Link / Warning headers for v1
//! - `router`: versioned route table with shared handler sets
//! - `catalog`: product routes guarded by the catalog breaker
//! - `server`: hyper accept loop and request pipeline

pub mod catalog;
pub mod deprecation;
pub mod router;
pub mod server;
pub mod version;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::error;

pub use deprecation::DeprecationNotice;
pub use router::{Handler, RequestContext, RouteSet, Router};
pub use server::ApiServer;
pub use version::{ApiVersion, VersionContext, VersionNegotiator, VersionSource};

/// HTTP body type for responses
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Wrap bytes into a response body
pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Serialize `value` as a JSON response
pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize response body");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"code":"INTERNAL_ERROR","message":"Failed to serialize response"}"#.to_vec(),
            )
        }
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
    response
}

/// `{code, message}` error body
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<BoxBody> {
    json_response(status, &json!({ "code": code, "message": message }))
}
