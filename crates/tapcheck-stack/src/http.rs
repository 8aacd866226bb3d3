// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: HTTP/1.x message framing, reply rendering and URI matching.
// Author: Lukas Bower

//! HTTP/1.x framing on top of `httparse`.
//!
//! Requests are delimited by `Content-Length`. Responses additionally support
//! chunked transfer coding and bodies terminated by connection close.

use std::borrow::Cow;

use httparse::{Status, EMPTY_HEADER};
use thiserror::Error;

/// Maximum number of headers accepted in one message.
pub const MAX_HEADERS: usize = 32;

/// Largest header block buffered before the message is rejected.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

/// Largest body accepted in one message.
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// HTTP framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    /// Header block could not be parsed.
    #[error("malformed header block: {0}")]
    Malformed(String),
    /// Header block exceeded [`MAX_HEAD_LEN`].
    #[error("header block exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,
    /// Body exceeded [`MAX_BODY_LEN`].
    #[error("body of {0} bytes exceeds limit")]
    BodyTooLarge(usize),
    /// `Content-Length` was not a decimal integer.
    #[error("invalid content-length {0:?}")]
    InvalidLength(String),
    /// Chunked body framing was invalid.
    #[error("invalid chunk framing")]
    InvalidChunk,
}

impl From<httparse::Error> for HttpError {
    fn from(err: httparse::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// A parsed HTTP request or response.
///
/// For requests `method`, `uri` and `query` come from the request line. For
/// responses `method` is empty, `uri` holds the numeric status and `reason`
/// the reason phrase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMessage {
    /// Request method, empty for responses.
    pub method: String,
    /// Request path without query, or the response status digits.
    pub uri: String,
    /// Query string without the leading `?`.
    pub query: String,
    /// Protocol version, e.g. `HTTP/1.1`.
    pub proto: String,
    /// Response reason phrase.
    pub reason: String,
    /// Header fields in arrival order.
    pub headers: Vec<(String, String)>,
    /// Decoded body.
    pub body: Vec<u8>,
    /// Raw bytes of the whole message as received.
    pub message: Vec<u8>,
}

impl HttpMessage {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Numeric status parsed from the leading digits of [`Self::uri`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        let digits: &str = {
            let end = self
                .uri
                .find(|ch: char| !ch.is_ascii_digit())
                .unwrap_or(self.uri.len());
            &self.uri[..end]
        };
        digits.parse().ok()
    }

    /// Body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Whole message as text, replacing invalid UTF-8.
    #[must_use]
    pub fn message_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.message)
    }

    fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> Result<Option<usize>, HttpError> {
        match self.header("Content-Length") {
            None => Ok(None),
            Some(value) => {
                let len: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| HttpError::InvalidLength(value.to_owned()))?;
                if len > MAX_BODY_LEN {
                    return Err(HttpError::BodyTooLarge(len));
                }
                Ok(Some(len))
            }
        }
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|header| {
            (
                header.name.to_owned(),
                String::from_utf8_lossy(header.value).trim().to_owned(),
            )
        })
        .collect()
}

fn check_partial(buf: &[u8]) -> Result<Option<(HttpMessage, usize)>, HttpError> {
    if buf.len() > MAX_HEAD_LEN {
        Err(HttpError::HeadTooLarge)
    } else {
        Ok(None)
    }
}

/// Parse one request from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied, or `None` while
/// the request is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpMessage, usize)>, HttpError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return check_partial(buf),
    };
    let target = req.path.unwrap_or("/");
    let (uri, query) = target.split_once('?').unwrap_or((target, ""));
    let mut message = HttpMessage {
        method: req.method.unwrap_or_default().to_owned(),
        uri: uri.to_owned(),
        query: query.to_owned(),
        proto: format!("HTTP/1.{}", req.version.unwrap_or(1)),
        headers: collect_headers(req.headers),
        ..HttpMessage::default()
    };
    let rest = &buf[head_len..];
    let (body, used) = if message.is_chunked() {
        match dechunk(rest)? {
            Some(decoded) => decoded,
            None => return Ok(None),
        }
    } else {
        let len = message.content_length()?.unwrap_or(0);
        if rest.len() < len {
            return Ok(None);
        }
        (rest[..len].to_vec(), len)
    };
    let total = head_len + used;
    message.body = body;
    message.message = buf[..total].to_vec();
    Ok(Some((message, total)))
}

/// Parse one response from the front of `buf`.
///
/// `eof` tells whether the peer has finished sending, which completes
/// responses that carry neither a length nor chunked coding.
pub fn parse_response(buf: &[u8], eof: bool) -> Result<Option<(HttpMessage, usize)>, HttpError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let head_len = match resp.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return check_partial(buf),
    };
    let code = resp.code.unwrap_or(0);
    let mut message = HttpMessage {
        uri: code.to_string(),
        proto: format!("HTTP/1.{}", resp.version.unwrap_or(1)),
        reason: resp.reason.unwrap_or_default().to_owned(),
        headers: collect_headers(resp.headers),
        ..HttpMessage::default()
    };
    let rest = &buf[head_len..];
    let (body, used) = if (100..200).contains(&code) || code == 204 || code == 304 {
        (Vec::new(), 0)
    } else if message.is_chunked() {
        match dechunk(rest)? {
            Some(decoded) => decoded,
            None => return Ok(None),
        }
    } else if let Some(len) = message.content_length()? {
        if rest.len() < len {
            return Ok(None);
        }
        (rest[..len].to_vec(), len)
    } else if eof {
        (rest.to_vec(), rest.len())
    } else {
        if rest.len() > MAX_BODY_LEN {
            return Err(HttpError::BodyTooLarge(rest.len()));
        }
        return Ok(None);
    };
    let total = head_len + used;
    message.body = body;
    message.message = buf[..total].to_vec();
    Ok(Some((message, total)))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// Decode a chunked body, returning it with the encoded length once complete.
fn dechunk(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, HttpError> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let Some(line_len) = find_crlf(&buf[pos..]) else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[pos..pos + line_len]).map_err(|_| HttpError::InvalidChunk)?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| HttpError::InvalidChunk)?;
        pos += line_len + 2;
        if size == 0 {
            // Trailer fields end at the first empty line.
            loop {
                let Some(trailer_len) = find_crlf(&buf[pos..]) else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }
        if body.len() + size > MAX_BODY_LEN {
            return Err(HttpError::BodyTooLarge(body.len() + size));
        }
        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(HttpError::InvalidChunk);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

/// Reason phrase for common status codes.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "OK",
    }
}

/// Render a complete HTTP/1.1 response.
///
/// `headers` is inserted verbatim and must be empty or end in `\r\n`.
/// `Content-Length` is always appended.
#[must_use]
pub fn render_reply(status: u16, headers: &str, body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 {status} {}\r\n{headers}Content-Length: {}\r\n\r\n",
        reason_phrase(status),
        body.len()
    );
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Glob match for request paths.
///
/// `*` matches any run of characters other than `/`, `#` matches any run of
/// characters and `?` matches exactly one character.
#[must_use]
pub fn match_uri(uri: &str, pattern: &str) -> bool {
    glob(uri.as_bytes(), pattern.as_bytes())
}

fn glob(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'#', rest)) => (0..=text.len()).any(|skip| glob(&text[skip..], rest)),
        Some((b'*', rest)) => {
            let segment = text.iter().position(|&b| b == b'/').unwrap_or(text.len());
            (0..=segment).any(|skip| glob(&text[skip..], rest))
        }
        Some((b'?', rest)) => !text.is_empty() && glob(&text[1..], rest),
        Some((&expected, rest)) => text.first() == Some(&expected) && glob(&text[1..], rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_waits_for_full_body() {
        let raw = b"POST /body HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(parse_request(raw).expect("parse"), None);

        let raw = b"POST /body?x=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhelloGET";
        let (msg, used) = parse_request(raw).expect("parse").expect("complete");
        assert_eq!(used, raw.len() - 3);
        assert_eq!(msg.method, "POST");
        assert_eq!(msg.uri, "/body");
        assert_eq!(msg.query, "x=1");
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.header("content-length"), Some("5"));
    }

    #[test]
    fn chunked_request_body_is_decoded() {
        let raw = b"POST /body HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\nGET";
        let (msg, used) = parse_request(raw).expect("parse").expect("complete");
        assert_eq!(used, raw.len() - 3);
        assert_eq!(msg.body, b"abcde");
        assert_eq!(parse_request(&raw[..raw.len() - 6]).expect("parse"), None);
    }

    #[test]
    fn response_with_length() {
        let raw = b"HTTP/1.1 301 Moved Permanently\r\nLocation: /\r\nContent-Length: 2\r\n\r\nok";
        let (msg, used) = parse_response(raw, false).expect("parse").expect("complete");
        assert_eq!(used, raw.len());
        assert_eq!(msg.status(), Some(301));
        assert_eq!(msg.reason, "Moved Permanently");
        assert_eq!(msg.body_text(), "ok");
    }

    #[test]
    fn response_until_close() {
        let raw = b"HTTP/1.0 200 OK\r\nServer: t\r\n\r\nstream";
        assert_eq!(parse_response(raw, false).expect("parse"), None);
        let (msg, _) = parse_response(raw, true).expect("parse").expect("complete");
        assert_eq!(msg.body, b"stream");
        assert_eq!(msg.proto, "HTTP/1.0");
    }

    #[test]
    fn response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (msg, used) = parse_response(raw, false).expect("parse").expect("complete");
        assert_eq!(used, raw.len());
        assert_eq!(msg.body, b"Wikipedia");

        let partial = &raw[..raw.len() - 2];
        assert_eq!(parse_response(partial, false).expect("parse"), None);
    }

    #[test]
    fn bad_chunk_is_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert_eq!(parse_response(raw, false), Err(HttpError::InvalidChunk));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.resize(MAX_HEAD_LEN + 1, b'a');
        assert_eq!(parse_request(&raw), Err(HttpError::HeadTooLarge));
    }

    #[test]
    fn status_uses_numeric_prefix() {
        let msg = HttpMessage {
            uri: "404abc".into(),
            ..HttpMessage::default()
        };
        assert_eq!(msg.status(), Some(404));
        assert_eq!(HttpMessage::default().status(), None);
    }

    #[test]
    fn reply_carries_length() {
        let out = render_reply(200, "X-Test: 1\r\n", b"hello");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nX-Test: 1\r\n"));
        assert!(text.ends_with("Content-Length: 5\r\n\r\nhello"));
    }

    #[test]
    fn uri_globbing() {
        assert!(match_uri("/foo/bar", "/foo/*"));
        assert!(match_uri("/foo/", "/foo/*"));
        assert!(!match_uri("/foo/bar/baz", "/foo/*"));
        assert!(match_uri("/foo/bar/baz", "/foo/#"));
        assert!(match_uri("/ws", "/ws"));
        assert!(!match_uri("/wss", "/ws"));
        assert!(match_uri("/a1", "/a?"));
    }
}
