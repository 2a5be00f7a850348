//! Turns the fully accumulated bytes of one request cycle into a
//! [`super::Request`] value, using `httparse` the way the teacher crate's
//! `proto/h1` parsing does (a fixed header-slot array, one pass over the
//! buffer), but against `http::HeaderMap` rather than a bespoke `Headers`
//! type.

use bytes::Bytes;

const MAX_HEADERS: usize = 128;

/// Parses one complete HTTP/1.x request out of `buf`. Called by the
/// dispatch task (§4.5 step (a)) once [`crate::channel::ChannelContext`]
/// has already confirmed framing is `COMPLETE` — so `Ok(None)` here
/// indicates a disagreement between the two parsers rather than a
/// legitimate "need more bytes" state.
pub fn parse_request(buf: &[u8]) -> Result<super::Request, crate::error::Error> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_slots);

    let body_offset = match req
        .parse(buf)
        .map_err(|e| crate::error::Error::Framing(e.to_string()))?
    {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => {
            return Err(crate::error::Error::Framing(
                "framing reported complete but parser saw a partial request".into(),
            ))
        }
    };

    let method = req
        .method
        .ok_or_else(|| crate::error::Error::Framing("missing method".into()))?;
    let method = http::Method::from_bytes(method.as_bytes())
        .map_err(|_| crate::error::Error::Framing(format!("invalid method {method}")))?;

    let path = req
        .path
        .ok_or_else(|| crate::error::Error::Framing("missing request-target".into()))?;
    let uri: http::Uri = path
        .parse()
        .map_err(|_| crate::error::Error::Framing(format!("invalid request-target {path}")))?;

    let version = match req.version {
        Some(1) => http::Version::HTTP_11,
        Some(0) => http::Version::HTTP_10,
        _ => {
            return Err(crate::error::Error::Framing(
                "unsupported on-wire version".into(),
            ))
        }
    };

    let mut headers = http::HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = http::header::HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| crate::error::Error::Framing(format!("invalid header name {}", h.name)))?;
        let value = http::HeaderValue::from_bytes(h.value)
            .map_err(|_| crate::error::Error::Framing(format!("invalid header value for {}", h.name)))?;
        headers.append(name, value);
    }

    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let body_end = body_offset + content_length;
    if body_end > buf.len() {
        return Err(crate::error::Error::Framing(
            "content-length exceeds accumulated body".into(),
        ));
    }
    let body = Bytes::copy_from_slice(&buf[body_offset..body_end]);

    Ok(super::Request {
        method,
        uri,
        version,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_with_headers() {
        let raw = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, http::Method::GET);
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.version, http::Version::HTTP_11);
        assert_eq!(req.headers.get("host").unwrap(), "x");
        assert!(req.body.is_empty());
    }

    #[test]
    fn parses_post_with_body() {
        let raw = b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, http::Method::POST);
        assert_eq!(&req.body[..], b"hello");
    }

    #[test]
    fn rejects_invalid_method_token() {
        let raw = b"NOT-A-VALID-REQUEST\r\n\r\n";
        assert!(parse_request(raw).is_err());
    }
}
