//! §4.8 — the response-builder capability handed to a handler body.
//! Single-use per request cycle: a second call to any `send_*`/`write_*`
//! method simply overwrites whatever body was staged before it.

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};

use crate::wire::Response;

#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: http::HeaderMap,
    body: Bytes,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        ResponseBuilder {
            status: StatusCode::OK,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn set_content_type(&mut self, content_type: &'static str) -> &mut Self {
        self.headers
            .insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        self
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Overwrites the body with raw bytes.
    pub fn write_bytes(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Overwrites the body with a UTF-8 string.
    pub fn write_string(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = Bytes::from(body.into().into_bytes());
        self
    }

    /// Sets `application/json` and overwrites the body with an
    /// already-encoded payload (encoding JSON is a caller concern; the
    /// value-object collaborators this crate reuses don't include a
    /// serializer).
    pub fn send_json(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.set_content_type("application/json");
        self.write_bytes(body)
    }

    pub fn send_html(&mut self, body: impl Into<String>) -> &mut Self {
        self.set_content_type("text/html; charset=utf-8");
        self.write_string(body)
    }

    pub fn send_error(&mut self, status: StatusCode, message: impl Into<String>) -> &mut Self {
        self.set_status(status);
        self.write_string(message)
    }

    /// Materializes the staged state into a [`Response`] value without
    /// consuming the builder, so it can be called through a shared lock
    /// (the async dispatch path holds the builder behind `Arc<Mutex<_>>`).
    pub fn build(&self) -> Response {
        Response {
            status: self.status,
            version: http::Version::HTTP_11,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_write_overwrites_first() {
        let mut builder = ResponseBuilder::new();
        builder.write_string("first");
        builder.write_string("second");
        assert_eq!(builder.build().body, Bytes::from_static(b"second"));
    }

    #[test]
    fn send_json_sets_content_type() {
        let mut builder = ResponseBuilder::new();
        builder.send_json(Bytes::from_static(b"{}"));
        let response = builder.build();
        assert_eq!(
            response.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn send_error_sets_status_and_body() {
        let mut builder = ResponseBuilder::new();
        builder.send_error(StatusCode::SERVICE_UNAVAILABLE, "overloaded");
        let response = builder.build();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body, Bytes::from_static(b"overloaded"));
    }
}
