//! Minimal HTTP/1.1 framing.
//!
//! Requests carry their body via `Content-Length`; chunked transfer coding is
//! rejected. Header semantics beyond framing are left to the tasks.

use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::KernelError;
use crate::infra::protocol::{chunk, CommunicationProtocol, ProtocolDecoder};

/// Largest accepted request or status line plus headers.
pub const DEFAULT_MAX_HEAD: usize = 16 * 1024;

/// Largest accepted `Content-Length`.
pub const DEFAULT_MAX_BODY: usize = 8 * 1024 * 1024;

/// Decoded HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method token, e.g. `GET`.
    pub method: String,
    /// Request target.
    pub path: String,
    /// Protocol version, e.g. `HTTP/1.1`.
    pub version: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

impl HttpRequest {
    /// `GET path` with no headers and an empty body.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path, Bytes::new())
    }

    /// Request with `method`, `path` and `body`.
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            version: "HTTP/1.1".into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// HTTP response produced by a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Headers other than `Content-Length`.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Response with `status`, its canonical reason and `body`.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: reason_phrase(status).into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// `200 OK` with `body`.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Parsed start line and headers, waiting for the body.
#[derive(Debug)]
struct Head {
    start: [String; 3],
    headers: Vec<(String, String)>,
    content_length: usize,
}

/// Shared framing state for both directions.
#[derive(Debug)]
struct Framer {
    head: Option<Head>,
    max_head: usize,
    max_body: usize,
}

impl Framer {
    const fn new(max_head: usize, max_body: usize) -> Self {
        Self {
            head: None,
            max_head,
            max_body,
        }
    }

    fn decode(&mut self, input: &mut BytesMut) -> Result<Option<(Head, Bytes)>, KernelError> {
        if self.head.is_none() {
            let Some(end) = input.windows(4).position(|w| w == b"\r\n\r\n") else {
                if input.len() > self.max_head {
                    return Err(KernelError::Protocol("header section too large".into()));
                }
                return Ok(None);
            };
            if end > self.max_head {
                return Err(KernelError::Protocol("header section too large".into()));
            }
            let raw = input.split_to(end + 4);
            let head = parse_head(&raw[..end])?;
            if head.content_length > self.max_body {
                return Err(KernelError::Protocol(format!(
                    "content-length {} exceeds limit of {}",
                    head.content_length, self.max_body
                )));
            }
            self.head = Some(head);
        }

        let needed = self.head.as_ref().map_or(0, |h| h.content_length);
        if input.len() < needed {
            return Ok(None);
        }
        let body = input.split_to(needed).freeze();
        Ok(self.head.take().map(|head| (head, body)))
    }
}

fn parse_head(raw: &[u8]) -> Result<Head, KernelError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| KernelError::Protocol("header section is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or_default();
    let mut parts = start_line.splitn(3, ' ');
    let start = [
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    ];
    if start.iter().any(String::is_empty) {
        return Err(KernelError::Protocol(format!("malformed start line `{start_line}`")));
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| KernelError::Protocol(format!("malformed header `{line}`")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    if find_header(&headers, "transfer-encoding").is_some() {
        return Err(KernelError::Protocol("transfer-encoding is not supported".into()));
    }
    let content_length = match find_header(&headers, "content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| KernelError::Protocol(format!("invalid content-length `{value}`")))?,
        None => 0,
    };
    Ok(Head {
        start,
        headers,
        content_length,
    })
}

/// Server-side request decoder.
#[derive(Debug)]
pub struct HttpRequestDecoder {
    framer: Framer,
}

impl ProtocolDecoder for HttpRequestDecoder {
    type Request = HttpRequest;

    fn decode(&mut self, input: &mut BytesMut) -> Result<Option<HttpRequest>, KernelError> {
        Ok(self.framer.decode(input)?.map(|(head, body)| {
            let [method, path, version] = head.start;
            HttpRequest {
                method,
                path,
                version,
                headers: head.headers,
                body,
            }
        }))
    }
}

/// Client-side response decoder.
#[derive(Debug)]
pub struct HttpResponseDecoder {
    framer: Framer,
}

impl Default for HttpResponseDecoder {
    fn default() -> Self {
        Self {
            framer: Framer::new(DEFAULT_MAX_HEAD, DEFAULT_MAX_BODY),
        }
    }
}

impl HttpResponseDecoder {
    /// Decode one response from the front of `input`.
    ///
    /// # Errors
    ///
    /// `KernelError::Protocol` for malformed framing.
    pub fn decode(&mut self, input: &mut BytesMut) -> Result<Option<HttpResponse>, KernelError> {
        let Some((head, body)) = self.framer.decode(input)? else {
            return Ok(None);
        };
        let [_version, status, reason] = head.start;
        let status: u16 = status
            .parse()
            .map_err(|_| KernelError::Protocol(format!("invalid status `{status}`")))?;
        let headers = head
            .headers
            .into_iter()
            .filter(|(n, _)| !n.eq_ignore_ascii_case("content-length"))
            .collect();
        Ok(Some(HttpResponse {
            status,
            reason,
            headers,
            body,
        }))
    }
}

/// HTTP/1.1 protocol binding.
#[derive(Debug, Clone)]
pub struct HttpProtocol {
    max_head: usize,
    max_body: usize,
}

impl Default for HttpProtocol {
    fn default() -> Self {
        Self {
            max_head: DEFAULT_MAX_HEAD,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

impl HttpProtocol {
    /// Protocol limiting the header section to `max_head` bytes.
    #[must_use]
    pub const fn with_max_head(max_head: usize) -> Self {
        Self {
            max_head,
            max_body: DEFAULT_MAX_BODY,
        }
    }

    /// Reject requests declaring a body longer than `max_body` bytes.
    #[must_use]
    pub const fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Encode a request as a client would send it.
    #[must_use]
    pub fn encode_request(request: &HttpRequest) -> Bytes {
        let mut head = format!("{} {} {}\r\n", request.method, request.path, request.version);
        write_headers(&mut head, &request.headers, request.body.len());
        let mut out = BytesMut::with_capacity(head.len() + request.body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(&request.body);
        out.freeze()
    }

    /// Decode a response as a client would receive it.
    ///
    /// `input` is left untouched until a complete response is buffered.
    ///
    /// # Errors
    ///
    /// `KernelError::Protocol` for malformed framing.
    pub fn decode_response(input: &mut BytesMut) -> Result<Option<HttpResponse>, KernelError> {
        let mut scratch = input.clone();
        let response = HttpResponseDecoder::default().decode(&mut scratch)?;
        if response.is_some() {
            input.advance(input.len() - scratch.len());
        }
        Ok(response)
    }
}

fn write_headers(out: &mut String, headers: &[(String, String)], body_len: usize) {
    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("content-length") {
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }
    let _ = write!(out, "Content-Length: {body_len}\r\n\r\n");
}

impl CommunicationProtocol for HttpProtocol {
    type Request = HttpRequest;
    type Response = HttpResponse;
    type Decoder = HttpRequestDecoder;

    fn new_decoder(&self) -> HttpRequestDecoder {
        HttpRequestDecoder {
            framer: Framer::new(self.max_head, self.max_body),
        }
    }

    fn encode(&self, response: &HttpResponse, write_buffer_size: usize) -> Vec<Bytes> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
        write_headers(&mut head, &response.headers, response.body.len());
        let mut chunks = chunk(Bytes::from(head), write_buffer_size);
        chunks.extend(chunk(response.body.clone(), write_buffer_size));
        chunks
    }

    fn failure_response(&self, failure: Option<&anyhow::Error>) -> HttpResponse {
        let busy = failure
            .and_then(|f| f.downcast_ref::<KernelError>())
            .is_some_and(|e| matches!(e, KernelError::PoolExhausted(_) | KernelError::QueueFull(_)));
        let response = if busy {
            HttpResponse::new(503, "service unavailable\n")
        } else {
            HttpResponse::new(500, "internal server error\n")
        };
        response.with_header("Content-Type", "text/plain")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_needs_full_body() {
        let protocol = HttpProtocol::default();
        let mut decoder = protocol.new_decoder();
        let mut input = BytesMut::from(&b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel"[..]);
        assert!(decoder.decode(&mut input).unwrap().is_none());

        input.extend_from_slice(b"lo");
        let request = decoder.decode(&mut input).unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, Bytes::from_static(b"hello"));
        assert!(input.is_empty());
    }

    #[test]
    fn test_pipelined_requests_decode_in_order() {
        let protocol = HttpProtocol::default();
        let mut decoder = protocol.new_decoder();
        let mut input = BytesMut::new();
        input.extend_from_slice(&HttpProtocol::encode_request(&HttpRequest::get("/a")));
        input.extend_from_slice(&HttpProtocol::encode_request(&HttpRequest::get("/b")));
        let paths: Vec<_> = decoder
            .decode_all(&mut input)
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(paths, vec!["/a", "/b"]);
    }

    #[test]
    fn test_malformed_head_is_rejected() {
        let mut decoder = HttpProtocol::default().new_decoder();
        let mut input = BytesMut::from(&b"GARBAGE\r\n\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut input),
            Err(KernelError::Protocol(_))
        ));

        let mut decoder = HttpProtocol::with_max_head(8).new_decoder();
        let mut input = BytesMut::from(&b"GET / HTTP/1.1\r\nHost"[..]);
        assert!(decoder.decode(&mut input).is_err());
    }

    #[test]
    fn test_head_over_limit_is_rejected_when_complete() {
        let mut decoder = HttpProtocol::with_max_head(64).new_decoder();
        let mut input = BytesMut::from(
            format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n\r\n", "a".repeat(200)).as_bytes(),
        );
        assert!(matches!(
            decoder.decode(&mut input),
            Err(KernelError::Protocol(_))
        ));
    }

    #[test]
    fn test_declared_body_over_limit_is_rejected() {
        let mut decoder = HttpProtocol::default().with_max_body(1024).new_decoder();
        let mut input = BytesMut::from(&b"POST /x HTTP/1.1\r\nContent-Length: 999999999999\r\n\r\n"[..]);
        input.extend_from_slice(&[b'x'; 4096]);
        let err = decoder.decode(&mut input).unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));

        let mut decoder = HttpProtocol::default().with_max_body(1024).new_decoder();
        let mut input = BytesMut::from(&b"POST /x HTTP/1.1\r\nContent-Length: 1024\r\n\r\n"[..]);
        input.extend_from_slice(&[b'x'; 1024]);
        assert_eq!(decoder.decode(&mut input).unwrap().unwrap().body.len(), 1024);
    }

    #[test]
    fn test_encoded_response_is_chunked() {
        let protocol = HttpProtocol::default();
        let response = HttpResponse::ok(vec![b'x'; 100]);
        let chunks = protocol.encode(&response, 32);
        assert!(chunks.iter().all(|c| c.len() <= 32));

        let mut input: BytesMut = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let decoded = HttpProtocol::decode_response(&mut input).unwrap().unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_failure_response_maps_exhaustion_to_503() {
        let protocol = HttpProtocol::default();
        let busy = anyhow::Error::new(KernelError::PoolExhausted("db".into()));
        assert_eq!(protocol.failure_response(Some(&busy)).status, 503);
        assert_eq!(protocol.failure_response(None).status, 500);
    }
}
