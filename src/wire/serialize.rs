//! Serializes a [`super::Response`] into the mirror-image wire format
//! described in §6: `VERSION SP STATUS SP REASON CRLF`, headers, empty
//! line, body.

use bytes::{BufMut, Bytes, BytesMut};

fn version_str(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Renders `response` to bytes ready to write to the socket. `Content-Length`
/// is always computed from the body and set explicitly (the design has no
/// chunked transfer-encoding — see Non-goals), overriding any stale value
/// a handler may have set on the header map.
pub fn serialize_response(response: &super::Response) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + response.body.len());

    buf.put_slice(version_str(response.version).as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(response.status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(
        response
            .status
            .canonical_reason()
            .unwrap_or("")
            .as_bytes(),
    );
    buf.put_slice(b"\r\n");

    for (name, value) in response.headers.iter() {
        if name == http::header::CONTENT_LENGTH {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"Content-Length: ");
    let mut len_buf = Vec::new();
    itoa::write(&mut len_buf, response.body.len()).expect("write to Vec never fails");
    buf.put_slice(&len_buf);
    buf.put_slice(b"\r\n\r\n");

    buf.put_slice(&response.body);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_status_and_body() {
        let mut resp = super::super::Response::new(http::StatusCode::OK);
        resp.headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        );
        resp.body = Bytes::from_static(b"ok");

        let bytes = serialize_response(&resp);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }
}
