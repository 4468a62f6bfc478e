//! RTSP/1.0 response parsing (RFC 2326 §7, syntactically a close relative of
//! HTTP/1.1 responses).
//!
//! This is a small hand-rolled parser rather than a dependency on any
//! pre-1.0 RTSP crate; see DESIGN.md for why. It supports exactly what a
//! DESCRIBE/SETUP/PLAY/TEARDOWN exchange produces: a status line, headers,
//! and an optional `Content-Length`-framed body. Chunked transfer encoding
//! does not exist in RTSP and is not handled.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The buffer may contain a complete response once more bytes arrive;
    /// this is not a parse failure.
    #[error("incomplete response")]
    NeedMore,
    #[error("malformed status line")]
    BadStatusLine,
    #[error("malformed header line")]
    BadHeaderLine,
    #[error("malformed or out-of-range Content-Length")]
    BadContentLength,
}

/// Attempt to parse one RTSP response from the front of `buf`.
///
/// On success, returns the parsed [`Response`] and the number of bytes of
/// `buf` it consumed (the caller should drop that many bytes from the
/// front of its buffer before the next call). On [`ParseError::NeedMore`],
/// `buf` is left untouched and the caller should append more data and
/// retry. Any other error means `buf`'s head is not a valid RTSP response
/// and the caller should discard its buffered state and resynchronize.
pub fn parse(buf: &[u8]) -> Result<(Response, usize), ParseError> {
    let header_end = match find_double_crlf(buf) {
        Some(i) => i,
        None => return Err(ParseError::NeedMore),
    };
    let head = &buf[..header_end];
    let mut lines = split_crlf_lines(head);

    let status_line = lines.next().ok_or(ParseError::BadStatusLine)?;
    let status = parse_status_line(status_line)?;

    let mut headers = HashMap::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(ParseError::BadHeaderLine)?;
        headers.insert(
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }

    let body_start = header_end + 4; // "\r\n\r\n"
    let content_length: usize = match headers.get("content-length") {
        Some(v) => v.trim().parse().map_err(|_| ParseError::BadContentLength)?,
        None => 0,
    };

    let body_end = body_start
        .checked_add(content_length)
        .ok_or(ParseError::BadContentLength)?;
    if buf.len() < body_end {
        return Err(ParseError::NeedMore);
    }

    let body = buf[body_start..body_end].to_vec();
    Ok((
        Response {
            status,
            headers,
            body,
        },
        body_end,
    ))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_crlf_lines(head: &[u8]) -> impl Iterator<Item = &str> {
    // head has no trailing \r\n\r\n (that was the terminator); lines inside
    // are separated by \r\n.
    std::str::from_utf8(head)
        .unwrap_or("")
        .split("\r\n")
        .filter(|l| !l.is_empty())
}

fn parse_status_line(line: &str) -> Result<u16, ParseError> {
    // "RTSP/1.0 200 OK"
    let mut parts = line.splitn(3, ' ');
    let proto = parts.next().ok_or(ParseError::BadStatusLine)?;
    if !proto.eq_ignore_ascii_case("RTSP/1.0") {
        return Err(ParseError::BadStatusLine);
    }
    let status = parts.next().ok_or(ParseError::BadStatusLine)?;
    status.parse().map_err(|_| ParseError::BadStatusLine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_200_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 5\r\n\
\r\n\
v=0\r\nEXTRA";
        let (resp, consumed) = parse(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-type"), Some("application/sdp"));
        assert_eq!(resp.body, b"v=0\r\n");
        assert_eq!(&raw[consumed..], b"EXTRA");
    }

    #[test]
    fn needs_more_when_headers_incomplete() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n";
        assert_eq!(parse(raw), Err(ParseError::NeedMore));
    }

    #[test]
    fn needs_more_when_body_incomplete() {
        let raw = b"RTSP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert_eq!(parse(raw), Err(ParseError::NeedMore));
    }

    #[test]
    fn zero_length_body_consumes_just_headers() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n";
        let (resp, consumed) = parse(raw).unwrap();
        assert!(resp.body.is_empty());
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn rejects_bad_status_line() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n";
        assert_eq!(parse(raw), Err(ParseError::BadStatusLine));
    }
}
