//! Minimal HTTP/1.1 request/response framing shared by the HTTP and HTTPS
//! proxies: parse into the rule pipeline's `MutableRequest`/response
//! shape, then re-serialize after rules run.

use matchlock_shared::{MatchlockError, MatchlockResult};
use std::collections::BTreeMap;

use super::rules::{MutableRequest, MutableResponse};

pub struct ParsedRequest {
    pub method: String,
    pub path_and_query: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub header_bytes_len: usize,
}

/// Parse a request's header block (ending at the blank line). Returns
/// `None` if the buffer doesn't yet contain a complete header block.
pub fn parse_request_headers(buf: &[u8]) -> MatchlockResult<Option<ParsedRequest>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req
        .parse(buf)
        .map_err(|e| MatchlockError::Network(format!("parsing HTTP request: {e}")))?
    {
        httparse::Status::Complete(len) => {
            let method = req.method.unwrap_or("GET").to_string();
            let path = req.path.unwrap_or("/").to_string();
            let version_minor = req.version.unwrap_or(1);
            let parsed_headers = req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            Ok(Some(ParsedRequest {
                method,
                path_and_query: path,
                version_minor,
                headers: parsed_headers,
                header_bytes_len: len,
            }))
        }
        httparse::Status::Partial => Ok(None),
    }
}

pub struct ParsedResponse {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub header_bytes_len: usize,
}

pub fn parse_response_headers(buf: &[u8]) -> MatchlockResult<Option<ParsedResponse>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    match resp
        .parse(buf)
        .map_err(|e| MatchlockError::Network(format!("parsing HTTP response: {e}")))?
    {
        httparse::Status::Complete(len) => {
            let status = resp.code.unwrap_or(502);
            let reason = resp.reason.unwrap_or("").to_string();
            let version_minor = resp.version.unwrap_or(1);
            let parsed_headers = resp
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            Ok(Some(ParsedResponse {
                status,
                reason,
                version_minor,
                headers: parsed_headers,
                header_bytes_len: len,
            }))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Split `path?query` into a `MutableRequest`'s path + decoded query map.
pub fn split_path_query(path_and_query: &str, headers: Vec<(String, String)>) -> MutableRequest {
    let (path, query_str) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
    let mut query = BTreeMap::new();
    for pair in query_str.split('&').filter(|s| !s.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(
            url::form_urlencoded::parse(k.as_bytes()).map(|(k, _)| k.into_owned()).next().unwrap_or_default(),
            url::form_urlencoded::parse(v.as_bytes()).map(|(v, _)| v.into_owned()).next().unwrap_or_default(),
        );
    }
    MutableRequest {
        path: path.to_string(),
        query,
        headers,
    }
}

pub fn join_path_query(req: &MutableRequest) -> String {
    if req.query.is_empty() {
        return req.path.clone();
    }
    let qs: Vec<String> = req
        .query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
        .collect();
    format!("{}?{}", req.path, qs.join("&"))
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Re-serialize a request line + headers for the upstream connection.
pub fn render_request_line_and_headers(
    method: &str,
    path_and_query: &str,
    version_minor: u8,
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut out = format!("{method} {path_and_query} HTTP/1.{version_minor}\r\n").into_bytes();
    for (k, v) in headers {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub fn render_status_line_and_headers(
    status: u16,
    reason: &str,
    version_minor: u8,
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut out = format!("HTTP/1.{version_minor} {status} {reason}\r\n").into_bytes();
    for (k, v) in headers {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn is_sse_response(headers: &[(String, String)]) -> bool {
    header_value(headers, "content-type")
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

pub fn mutable_response_from(headers: Vec<(String, String)>) -> MutableResponse {
    MutableResponse { headers }
}

/// Whether `Transfer-Encoding` names `chunked` (HTTP/1.1 allows a
/// comma-separated list; `chunked` must be the last one when present).
pub fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().split(',').any(|part| part.trim() == "chunked"))
        .unwrap_or(false)
}

/// Drops `Transfer-Encoding` and sets `Content-Length` to `body_len` --
/// used once a chunked body has been fully de-chunked into memory, so the
/// re-sent message carries framing that matches the bytes actually sent.
pub fn convert_framing_to_content_length(headers: &mut Vec<(String, String)>, body_len: usize) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case("transfer-encoding"));
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        Some(entry) => entry.1 = body_len.to_string(),
        None => headers.push(("Content-Length".to_string(), body_len.to_string())),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Incremental chunked-transfer-encoding decoder: fed raw bytes as they
/// arrive off the wire, yields de-chunked payload bytes as soon as each
/// chunk is fully buffered, without waiting for the whole body. Used so a
/// chunked SSE stream can still be rewritten and forwarded line-by-line in
/// real time rather than only once the stream ends.
#[derive(Default)]
pub struct ChunkedDecoder {
    buf: Vec<u8>,
    remaining_in_chunk: usize,
    last_chunk_seen: bool,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-received bytes; returns decoded payload ready to forward
    /// with chunk framing stripped.
    pub fn push(&mut self, incoming: &[u8]) -> Result<Vec<u8>, String> {
        self.buf.extend_from_slice(incoming);
        let mut out = Vec::new();
        loop {
            if self.remaining_in_chunk > 0 {
                let take = self.remaining_in_chunk.min(self.buf.len());
                out.extend(self.buf.drain(..take));
                self.remaining_in_chunk -= take;
                if self.remaining_in_chunk > 0 {
                    break;
                }
                if self.buf.len() < 2 {
                    break;
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err("malformed chunk terminator".to_string());
                }
                self.buf.drain(..2);
                continue;
            }
            if self.last_chunk_seen {
                break;
            }
            match find_subslice(&self.buf, b"\r\n") {
                Some(line_end) => {
                    let size_line = std::str::from_utf8(&self.buf[..line_end])
                        .map_err(|_| "invalid chunk size line".to_string())?;
                    let size_str = size_line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| format!("invalid chunk size: {size_str:?}"))?;
                    self.buf.drain(..line_end + 2);
                    if size == 0 {
                        self.last_chunk_seen = true;
                    } else {
                        self.remaining_in_chunk = size;
                    }
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// Whether the terminating zero-length chunk and its trailer/CRLF have
    /// been fully consumed -- i.e. the body is complete. Consumes those
    /// trailing bytes from the internal buffer once recognized.
    pub fn is_finished(&mut self) -> bool {
        if !self.last_chunk_seen {
            return false;
        }
        if self.buf.len() >= 2 && &self.buf[..2] == b"\r\n" {
            self.buf.drain(..2);
            return true;
        }
        if let Some(off) = find_subslice(&self.buf, b"\r\n\r\n") {
            self.buf.drain(..off + 4);
            return true;
        }
        false
    }

    /// Bytes left over after the terminator -- e.g. the start of the next
    /// pipelined request/response on a keep-alive connection.
    pub fn take_remainder(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Frame `data` as one HTTP chunk (`<hex-size>\r\n<data>\r\n`).
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// The terminating zero-length chunk with an empty trailer.
pub fn encode_last_chunk() -> &'static [u8] {
    b"0\r\n\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_request() {
        let raw = b"GET /anything/v1?drop=1 HTTP/1.1\r\nHost: httpbin.org\r\nX-Remove: 1\r\n\r\n";
        let parsed = parse_request_headers(raw).unwrap().unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path_and_query, "/anything/v1?drop=1");
        assert!(parsed.headers.iter().any(|(k, v)| k == "Host" && v == "httpbin.org"));
    }

    #[test]
    fn split_and_join_path_query_roundtrip() {
        let req = split_path_query("/a?x=1&y=2", vec![]);
        assert_eq!(req.path, "/a");
        assert_eq!(req.query.get("x").unwrap(), "1");
        let joined = join_path_query(&req);
        assert!(joined.starts_with("/a?"));
    }

    #[test]
    fn detects_sse_content_type() {
        let headers = vec![("Content-Type".to_string(), "text/event-stream".to_string())];
        assert!(is_sse_response(&headers));
    }

    #[test]
    fn detects_chunked_transfer_encoding() {
        let headers = vec![("Transfer-Encoding".to_string(), "chunked".to_string())];
        assert!(is_chunked(&headers));
        let headers = vec![("Transfer-Encoding".to_string(), "gzip, chunked".to_string())];
        assert!(is_chunked(&headers));
        let headers = vec![("Content-Length".to_string(), "5".to_string())];
        assert!(!is_chunked(&headers));
    }

    #[test]
    fn chunked_decoder_reassembles_split_feeds() {
        let mut dec = ChunkedDecoder::new();
        let mut out = dec.push(b"4\r\nWiki\r\n5\r\n").unwrap();
        out.extend(dec.push(b"pedia\r\n0\r\n\r\n").unwrap());
        assert_eq!(out, b"Wikipedia");
        assert!(dec.is_finished());
        assert!(dec.take_remainder().is_empty());
    }

    #[test]
    fn chunked_decoder_rejects_malformed_size() {
        let mut dec = ChunkedDecoder::new();
        assert!(dec.push(b"zz\r\nhi\r\n").is_err());
    }

    #[test]
    fn chunked_decoder_keeps_pipelined_remainder() {
        let mut dec = ChunkedDecoder::new();
        let out = dec.push(b"2\r\nhi\r\n0\r\n\r\nGET / HTTP/1.1\r\n").unwrap();
        assert_eq!(out, b"hi");
        assert!(dec.is_finished());
        assert_eq!(dec.take_remainder(), b"GET / HTTP/1.1\r\n");
    }
}
