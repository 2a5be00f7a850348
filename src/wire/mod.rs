//! The wire-format collaborators named as out-of-scope in §1 ("The HTTP
//! message parser and response serializer") are implemented here anyway,
//! since the crate has to compile and be exercised end-to-end — but kept
//! behind the same narrow interface the design treats them through: bytes
//! in, a [`Request`] value out; a [`Response`] value in, bytes out. The
//! value objects themselves reuse `http::{Method, Version, StatusCode,
//! HeaderMap}` (§1's other named external collaborator) rather than
//! reinventing them.

mod parse;
mod serialize;

pub use parse::parse_request;
pub use serialize::serialize_response;

use bytes::Bytes;

/// A fully framed HTTP request, produced once [`crate::channel::ChannelContext`]
/// reports `COMPLETE` and the accumulated bytes are handed to
/// [`parse_request`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: http::Method,
    pub uri: http::Uri,
    pub version: http::Version,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// A response value a handler produces; [`serialize_response`] turns it
/// into the bytes written back to the socket.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: http::StatusCode,
    pub version: http::Version,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: http::StatusCode) -> Self {
        Response {
            status,
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: http::StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut resp = Response::new(status);
        resp.headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(content_type),
        );
        resp.body = body.into();
        resp
    }

    pub fn text(status: http::StatusCode, body: impl Into<String>) -> Self {
        Response::with_body(status, "text/plain", body.into().into_bytes())
    }

    pub fn not_found() -> Self {
        Response::text(http::StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Response::text(http::StatusCode::BAD_REQUEST, msg.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Response::text(http::StatusCode::INTERNAL_SERVER_ERROR, msg.into())
    }

    pub fn request_timeout() -> Self {
        Response::text(http::StatusCode::REQUEST_TIMEOUT, "Request Timeout")
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Response::text(http::StatusCode::SERVICE_UNAVAILABLE, msg.into())
    }
}
