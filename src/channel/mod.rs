//! C6 — [`ChannelContext`]: the per-connection read buffer, framing state
//! machine, and response slot.
//!
//! The state machine here does its own lightweight scan of the
//! accumulating bytes (Design Notes §9: "parse bytes directly and keep
//! the buffer as a single contiguous byte vector with offsets") purely to
//! know *when* a request is complete and to extract the handful of
//! fields needed for framing decisions (method/URI/version,
//! `Content-Length`, `Connection`). The full header map is built later,
//! once, by [`crate::wire::parse_request`] — the "external" parser named
//! in §1.

use std::collections::HashMap;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::config::ChannelConfig;
use crate::error::Error;
use crate::wire::Response;

/// REQUEST_LINE → HEADERS → BODY? → COMPLETE, advancing monotonically
/// within one request cycle (§3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingState {
    RequestLine,
    Headers,
    Body,
    Complete,
}

/// One per accepted connection, owned exclusively by the reactor's
/// connection table.
pub struct ChannelContext {
    pub connection_id: u64,
    pub created_at: Instant,
    request_buffer: BytesMut,
    parsing_state: ParsingState,
    header_end_offset: Option<usize>,
    pub method: Option<String>,
    pub request_uri: Option<String>,
    pub http_version: Option<(u8, u8)>,
    pub content_length: usize,
    pub body_bytes_read: usize,
    pub keep_alive: bool,
    response_slot: Mutex<Option<Response>>,
    pub last_activity_at: Instant,
    pub request_count: u64,
    pub attributes: HashMap<String, String>,
    config: ChannelConfig,
}

impl ChannelContext {
    pub fn new(connection_id: u64, config: ChannelConfig) -> Self {
        let now = Instant::now();
        ChannelContext {
            connection_id,
            created_at: now,
            request_buffer: BytesMut::new(),
            parsing_state: ParsingState::RequestLine,
            header_end_offset: None,
            method: None,
            request_uri: None,
            http_version: None,
            content_length: 0,
            body_bytes_read: 0,
            keep_alive: true,
            response_slot: Mutex::new(None),
            last_activity_at: now,
            request_count: 0,
            attributes: HashMap::new(),
            config,
        }
    }

    pub fn parsing_state(&self) -> ParsingState {
        self.parsing_state
    }

    pub fn request_complete(&self) -> bool {
        self.parsing_state == ParsingState::Complete
    }

    /// Appends freshly read bytes and drives the state machine forward as
    /// far as the buffer allows. Returns `Ok(true)` once `COMPLETE`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<bool, Error> {
        self.request_buffer.extend_from_slice(bytes);
        self.last_activity_at = Instant::now();

        loop {
            match self.parsing_state {
                ParsingState::RequestLine => {
                    if !self.advance_request_line()? {
                        return Ok(false);
                    }
                }
                ParsingState::Headers => {
                    if !self.advance_headers()? {
                        return Ok(false);
                    }
                }
                ParsingState::Body => {
                    if !self.advance_body()? {
                        return Ok(false);
                    }
                }
                ParsingState::Complete => return Ok(true),
            }
        }
    }

    fn advance_request_line(&mut self) -> Result<bool, Error> {
        let end = match find(&self.request_buffer, b"\r\n") {
            Some(end) => end,
            None => {
                if self.request_buffer.len() > self.config.max_request_line {
                    return Err(Error::Framing("request line too long".into()));
                }
                return Ok(false);
            }
        };
        if end > self.config.max_request_line {
            return Err(Error::Framing("request line too long".into()));
        }

        let line = std::str::from_utf8(&self.request_buffer[..end])
            .map_err(|_| Error::Framing("request line not utf8".into()))?;
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next();
        let uri = parts.next();
        let version = parts.next();
        let (method, uri, version) = match (method, uri, version) {
            (Some(m), Some(u), Some(v)) if parts.next().is_none() => (m, u, v),
            _ => return Err(Error::Framing(format!("malformed request line: {line}"))),
        };

        let http_version = parse_version(version)
            .ok_or_else(|| Error::Framing(format!("unsupported version: {version}")))?;

        self.method = Some(method.to_string());
        self.request_uri = Some(uri.to_string());
        self.http_version = Some(http_version);
        // HTTP/1.1 defaults keep-alive true, HTTP/1.0 defaults false,
        // both overridden later if a Connection header is present.
        self.keep_alive = http_version >= (1, 1) && self.config.http11_keep_alive_default;

        self.parsing_state = ParsingState::Headers;
        Ok(true)
    }

    fn advance_headers(&mut self) -> Result<bool, Error> {
        // request line's own CRLF is part of request_buffer too; header
        // lines start right after it, and the header-block size limit
        // applies only to bytes from here on, not the request line.
        let line_end = find(&self.request_buffer, b"\r\n").unwrap();
        let headers_start = line_end + 2;

        let end = match find(&self.request_buffer, b"\r\n\r\n") {
            Some(end) => end,
            None => {
                let header_bytes_so_far = self.request_buffer.len().saturating_sub(headers_start);
                if header_bytes_so_far > self.config.max_header_block {
                    return Err(Error::Framing("header block too large".into()));
                }
                return Ok(false);
            }
        };
        let header_block_len = end - headers_start; // bytes strictly before the terminating blank line
        if header_block_len > self.config.max_header_block {
            return Err(Error::Framing("header block too large".into()));
        }

        let headers_region = &self.request_buffer[headers_start..end];

        let mut content_length = 0usize;
        let mut connection: Option<bool> = None;

        for line in split_lines(headers_region) {
            if line.len() > self.config.max_header_name + self.config.max_header_value {
                return Err(Error::Framing("header line too large".into()));
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| Error::Framing("header line missing colon".into()))?;
            if colon > self.config.max_header_name {
                return Err(Error::Framing("header name too long".into()));
            }
            let name = std::str::from_utf8(&line[..colon])
                .map_err(|_| Error::Framing("header name not utf8".into()))?
                .trim();
            let value_bytes = &line[colon + 1..];
            if value_bytes.len() > self.config.max_header_value {
                return Err(Error::Framing("header value too long".into()));
            }
            let value = std::str::from_utf8(value_bytes)
                .map_err(|_| Error::Framing("header value not utf8".into()))?
                .trim();

            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("connection") {
                connection = match value.to_ascii_lowercase().as_str() {
                    "keep-alive" => Some(true),
                    "close" => Some(false),
                    _ => None,
                };
            }
        }

        if content_length > self.config.max_body {
            return Err(Error::RequestTooLarge { len: content_length });
        }

        self.content_length = content_length;
        if let Some(explicit) = connection {
            self.keep_alive = explicit;
        }
        self.header_end_offset = Some(end + 4);

        self.parsing_state = if content_length > 0 {
            ParsingState::Body
        } else {
            ParsingState::Complete
        };
        Ok(true)
    }

    fn advance_body(&mut self) -> Result<bool, Error> {
        let header_end = self
            .header_end_offset
            .expect("header_end_offset set before entering Body state");
        let body_so_far = self.request_buffer.len().saturating_sub(header_end);
        self.body_bytes_read = body_so_far;
        if body_so_far >= self.content_length {
            self.parsing_state = ParsingState::Complete;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The fully accumulated bytes for the current request cycle (valid
    /// once `request_complete()`), handed to the external parser.
    pub fn buffer(&self) -> &[u8] {
        &self.request_buffer
    }

    /// Publishes the handler's response. One-shot per request cycle:
    /// subsequent writes overwrite, matching the builder's documented
    /// "double-writes overwrite" semantics rather than panicking, since
    /// only the single dispatch task for this cycle ever calls it.
    pub fn publish_response(&self, response: Response) {
        *self.response_slot.lock() = Some(response);
    }

    /// Reads the response slot without consuming it — repeat reads return
    /// the same value until `reset_for_new_request` runs.
    pub fn peek_response(&self) -> Option<Response> {
        self.response_slot.lock().clone()
    }

    pub fn take_response(&self) -> Option<Response> {
        self.response_slot.lock().take()
    }

    /// Clears buffer, response slot, and parsing state; preserves
    /// `connection_id`, `created_at`, and `keep_alive` (the next
    /// request's headers may still change it).
    pub fn reset_for_new_request(&mut self) {
        self.request_buffer.clear();
        self.header_end_offset = None;
        self.parsing_state = ParsingState::RequestLine;
        self.content_length = 0;
        self.body_bytes_read = 0;
        self.method = None;
        self.request_uri = None;
        self.http_version = None;
        *self.response_slot.lock() = None;
        self.request_count += 1;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
        self.last_activity_at = Instant::now();
    }
}

fn parse_version(token: &str) -> Option<(u8, u8)> {
    let rest = token.strip_prefix("HTTP/")?;
    let (major, minor) = rest.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_lines(region: &[u8]) -> impl Iterator<Item = &[u8]> {
    region
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ChannelContext {
        ChannelContext::new(1, ChannelConfig::default())
    }

    #[test]
    fn s1_get_with_no_body_completes_and_defaults_keep_alive() {
        let mut c = ctx();
        let complete = c.feed(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(complete);
        assert_eq!(c.parsing_state(), ParsingState::Complete);
        assert_eq!(c.method.as_deref(), Some("GET"));
        assert_eq!(c.request_uri.as_deref(), Some("/hello"));
        assert!(c.keep_alive);
    }

    #[test]
    fn s2_post_waits_for_full_body() {
        let mut c = ctx();
        let complete = c
            .feed(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhell")
            .unwrap();
        assert!(!complete);
        assert_eq!(c.parsing_state(), ParsingState::Body);

        let complete = c.feed(b"o").unwrap();
        assert!(complete);
    }

    #[test]
    fn boundary_one_byte_short_never_completes() {
        let mut c = ctx();
        let complete = c
            .feed(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhell")
            .unwrap();
        assert!(!complete);
        assert_eq!(c.parsing_state(), ParsingState::Body);
    }

    #[test]
    fn byte_at_a_time_matches_whole_chunk() {
        let whole = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut whole_ctx = ctx();
        whole_ctx.feed(whole).unwrap();

        let mut streamed_ctx = ctx();
        let mut done = false;
        for b in whole.iter() {
            done = streamed_ctx.feed(&[*b]).unwrap();
        }
        assert!(done);
        assert_eq!(whole_ctx.method, streamed_ctx.method);
        assert_eq!(whole_ctx.request_uri, streamed_ctx.request_uri);
        assert_eq!(whole_ctx.http_version, streamed_ctx.http_version);
    }

    #[test]
    fn malformed_request_line_is_framing_error() {
        let mut c = ctx();
        let err = c.feed(b"NOT-A-VALID-REQUEST\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn complete_is_monotonic_until_reset() {
        let mut c = ctx();
        c.feed(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(c.parsing_state(), ParsingState::Complete);
        // feeding more bytes post-COMPLETE must not move the state
        c.feed(b"garbage").unwrap();
        assert_eq!(c.parsing_state(), ParsingState::Complete);

        c.reset_for_new_request();
        assert_eq!(c.parsing_state(), ParsingState::RequestLine);
    }

    #[test]
    fn connection_close_header_overrides_default() {
        let mut c = ctx();
        c.feed(b"GET /a HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!c.keep_alive);
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut c = ctx();
        c.feed(b"GET /a HTTP/1.0\r\n\r\n").unwrap();
        assert!(!c.keep_alive);
    }

    #[test]
    fn long_request_line_does_not_count_against_header_block_limit() {
        let mut c = ctx();
        // request line alone is close to max_request_line (4096) but the
        // headers that follow are tiny; request-line + headers together
        // exceed max_header_block (8192) but the header block alone does
        // not, so this must succeed rather than fail with a framing error.
        let long_path = "a".repeat(4000);
        let request = format!("GET /{long_path} HTTP/1.1\r\nHost: x\r\n\r\n");
        let complete = c.feed(request.as_bytes()).unwrap();
        assert!(complete);
    }

    #[test]
    fn header_block_over_limit_is_rejected() {
        let mut c = ctx();
        let mut request = b"GET /a HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(9000));
        request.extend_from_slice(b"\r\n\r\n");
        let err = c.feed(&request).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }
}
