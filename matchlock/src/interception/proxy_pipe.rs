//! Shared HTTP/1.1 request/response pipe used by both the plain-HTTP and
//! HTTPS proxies: parses headers, runs the rule
//! pipeline, substitutes secret placeholders, forwards to upstream, then
//! applies `after` rules and (for SSE) per-`data:`-line body rewriting on
//! the way back.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::policy::{PolicyEngine, SecretStore};

use super::http::{
    convert_framing_to_content_length, encode_chunk, encode_last_chunk, header_value, is_chunked,
    is_sse_response, join_path_query, mutable_response_from, parse_request_headers, parse_response_headers,
    render_request_line_and_headers, render_status_line_and_headers, split_path_query, ChunkedDecoder,
};
use super::rules::RulePipeline;
use super::sse::{rewrite_sse_chunk, LineBuffer};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Resolves `host:port` to its first address via the system resolver and
/// returns the socket address to dial alongside the bare `IpAddr` so the
/// caller can both policy-check and connect against the exact same
/// resolution -- a second, independent lookup at connect time could race
/// DNS and dial an address the policy check never saw.
pub async fn resolve_upstream(host: &str, port: u16) -> Result<(std::net::SocketAddr, IpAddr), String> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("resolving {host}:{port}: {e}"))?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("no addresses found for {host}:{port}"))?;
    Ok((addr, addr.ip()))
}

/// Run the request/response loop for one connection, starting from
/// `initial_buf` (bytes already read off the wire while determining the
/// destination host, e.g. plain-HTTP's `Host:` sniff; empty for HTTPS,
/// which only starts reading after the TLS handshake completes).
pub async fn pipe_http_over<G, U>(
    guest: &mut G,
    mut upstream: U,
    host: &str,
    policy: &Arc<PolicyEngine>,
    rules: &Arc<RulePipeline>,
    initial_buf: Vec<u8>,
) -> Result<(), String>
where
    G: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = initial_buf;
    loop {
        let parsed = loop {
            if let Some(parsed) = parse_request_headers(&pending).map_err(|e| e.to_string())? {
                break parsed;
            }
            let mut chunk = [0u8; 4096];
            let n = guest.read(&mut chunk).await.map_err(|e| e.to_string())?;
            if n == 0 {
                return Ok(());
            }
            pending.extend_from_slice(&chunk[..n]);
            if pending.len() > MAX_HEADER_BYTES {
                return Err("request header block too large".into());
            }
        };

        let rest = pending[parsed.header_bytes_len..].to_vec();
        pending.clear();
        let req_chunked = is_chunked(&parsed.headers);
        let mut body = if req_chunked {
            let (body, remainder) = read_full_chunked(guest, &rest).await?;
            pending = remainder;
            body
        } else {
            let content_length = header_value(&parsed.headers, "content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            let mut body = rest;
            while body.len() < content_length {
                let mut chunk = vec![0u8; content_length - body.len()];
                let n = guest.read(&mut chunk).await.map_err(|e| e.to_string())?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body
        };

        let req = split_path_query(&parsed.path_and_query, parsed.headers.clone());
        let outcome = rules.run_before(host, &parsed.method, req).await;
        if outcome.blocked {
            return Ok(());
        }
        let mut mutable = outcome.request;

        if let Err(placeholder) = apply_secret_substitution(policy.secrets(), &mut body, host) {
            tracing::warn!(host, placeholder, "secret placeholder leaked toward unauthorized host; closing connection");
            return Ok(());
        }
        if let Err(placeholder) = substitute_headers(policy.secrets(), &mut mutable.headers, host) {
            tracing::warn!(host, placeholder, "secret placeholder leaked in headers toward unauthorized host; closing connection");
            return Ok(());
        }
        if let Err(placeholder) = substitute_path(policy.secrets(), &mut mutable.path, host) {
            tracing::warn!(host, placeholder, "secret placeholder leaked in path toward unauthorized host; closing connection");
            return Ok(());
        }
        if let Err(placeholder) = substitute_query(policy.secrets(), &mut mutable.query, host) {
            tracing::warn!(host, placeholder, "secret placeholder leaked in query toward unauthorized host; closing connection");
            return Ok(());
        }

        if req_chunked {
            convert_framing_to_content_length(&mut mutable.headers, body.len());
        }
        let path_and_query = join_path_query(&mutable);
        let mut out = render_request_line_and_headers(&parsed.method, &path_and_query, parsed.version_minor, &mutable.headers);
        out.extend_from_slice(&body);
        upstream.write_all(&out).await.map_err(|e| e.to_string())?;

        let mut resp_buf = Vec::new();
        let resp_parsed = loop {
            if let Some(parsed) = parse_response_headers(&resp_buf).map_err(|e| e.to_string())? {
                break parsed;
            }
            let mut chunk = [0u8; 4096];
            let n = upstream.read(&mut chunk).await.map_err(|e| e.to_string())?;
            if n == 0 {
                return Ok(());
            }
            resp_buf.extend_from_slice(&chunk[..n]);
            if resp_buf.len() > MAX_HEADER_BYTES {
                return Err("response header block too large".into());
            }
        };

        let is_sse = is_sse_response(&resp_parsed.headers);
        let resp_chunked = is_chunked(&resp_parsed.headers);
        let leftover = resp_buf[resp_parsed.header_bytes_len..].to_vec();

        let (mutated_resp, replacements) = rules
            .run_after(
                host,
                &parsed.method,
                &parsed.path_and_query,
                resp_parsed.status,
                is_sse,
                mutable_response_from(resp_parsed.headers.clone()),
            )
            .await;
        let mut resp_headers = mutated_resp.headers;

        if resp_chunked && !is_sse {
            // De-chunk fully before the header line goes out so the
            // length-based framing sent to the guest matches the bytes
            // that follow it -- same discipline as the Content-Length path.
            let (body, _remainder) = read_full_chunked(&mut upstream, &leftover).await?;
            convert_framing_to_content_length(&mut resp_headers, body.len());
            let resp_line = render_status_line_and_headers(resp_parsed.status, &resp_parsed.reason, resp_parsed.version_minor, &resp_headers);
            guest.write_all(&resp_line).await.map_err(|e| e.to_string())?;
            pipe_fixed_body(guest, &mut upstream, &body, Some(body.len()), &replacements).await?;
        } else {
            let resp_line = render_status_line_and_headers(resp_parsed.status, &resp_parsed.reason, resp_parsed.version_minor, &resp_headers);
            guest.write_all(&resp_line).await.map_err(|e| e.to_string())?;

            if is_sse {
                pipe_sse_body(guest, &mut upstream, &leftover, &replacements, resp_chunked).await?;
            } else {
                let resp_content_length = header_value(&resp_parsed.headers, "content-length").and_then(|v| v.parse::<usize>().ok());
                pipe_fixed_body(guest, &mut upstream, &leftover, resp_content_length, &replacements).await?;
            }
        }

        if header_value(&parsed.headers, "connection").map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false) {
            return Ok(());
        }
    }
}

async fn pipe_fixed_body<G, U>(guest: &mut G, upstream: &mut U, leftover: &[u8], content_length: Option<usize>, replacements: &[(String, String)]) -> Result<(), String>
where
    G: AsyncWrite + Unpin,
    U: AsyncRead + Unpin,
{
    let mut body = leftover.to_vec();
    if let Some(len) = content_length {
        while body.len() < len {
            let mut chunk = vec![0u8; len - body.len()];
            let n = upstream.read(&mut chunk).await.map_err(|e| e.to_string())?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    } else {
        let mut chunk = [0u8; 8192];
        loop {
            let n = upstream.read(&mut chunk).await.map_err(|e| e.to_string())?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }
    if !replacements.is_empty() {
        let mut text = String::from_utf8_lossy(&body).into_owned();
        for (find, replace) in replacements {
            text = text.replace(find.as_str(), replace.as_str());
        }
        body = text.into_bytes();
    }
    guest.write_all(&body).await.map_err(|e| e.to_string())?;
    Ok(())
}

/// Pipe an SSE body line-by-line, rewriting each `data:` line as it
/// arrives rather than buffering the whole stream (which may never end
/// while the connection is open). When `chunked`, the upstream bytes
/// carry HTTP chunk framing that must be stripped on the way in and
/// re-applied on the way out, since the guest-facing response also keeps
/// `Transfer-Encoding: chunked` for an unknown-length streaming body.
async fn pipe_sse_body<G, U>(guest: &mut G, upstream: &mut U, leftover: &[u8], replacements: &[(String, String)], chunked: bool) -> Result<(), String>
where
    G: AsyncWrite + Unpin,
    U: AsyncRead + Unpin,
{
    let mut line_buf = LineBuffer::default();
    let mut decoder = ChunkedDecoder::new();

    let first_payload = if chunked { decoder.push(leftover)? } else { leftover.to_vec() };
    write_sse_lines(guest, line_buf.push(&first_payload), replacements, chunked).await?;
    if chunked && decoder.is_finished() {
        return finish_sse_body(guest, &mut line_buf, replacements, chunked).await;
    }

    let mut chunk = [0u8; 4096];
    loop {
        let n = upstream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return finish_sse_body(guest, &mut line_buf, replacements, chunked).await;
        }
        let payload = if chunked { decoder.push(&chunk[..n])? } else { chunk[..n].to_vec() };
        write_sse_lines(guest, line_buf.push(&payload), replacements, chunked).await?;
        if chunked && decoder.is_finished() {
            return finish_sse_body(guest, &mut line_buf, replacements, chunked).await;
        }
    }
}

async fn write_sse_lines<G>(guest: &mut G, lines: Vec<String>, replacements: &[(String, String)], chunked: bool) -> Result<(), String>
where
    G: AsyncWrite + Unpin,
{
    for line in lines {
        let rewritten = rewrite_sse_chunk(&line, replacements);
        let framed = if chunked { encode_chunk(rewritten.as_bytes()) } else { rewritten.into_bytes() };
        guest.write_all(&framed).await.map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn finish_sse_body<G>(guest: &mut G, line_buf: &mut LineBuffer, replacements: &[(String, String)], chunked: bool) -> Result<(), String>
where
    G: AsyncWrite + Unpin,
{
    let remainder = line_buf.take_pending();
    if !remainder.is_empty() {
        write_sse_lines(guest, vec![remainder], replacements, chunked).await?;
    }
    if chunked {
        guest.write_all(encode_last_chunk()).await.map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Read and de-chunk a full request/response body starting from bytes
/// already buffered (`initial`), pulling more from `reader` as needed.
/// Returns the decoded body plus any bytes left over past the
/// terminating chunk (e.g. the start of the next pipelined message).
async fn read_full_chunked<R: AsyncRead + Unpin>(reader: &mut R, initial: &[u8]) -> Result<(Vec<u8>, Vec<u8>), String> {
    let mut decoder = ChunkedDecoder::new();
    let mut body = decoder.push(initial)?;
    loop {
        if decoder.is_finished() {
            return Ok((body, decoder.take_remainder()));
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("connection closed mid chunked body".to_string());
        }
        body.extend_from_slice(&decoder.push(&chunk[..n])?);
    }
}

fn apply_secret_substitution(secrets: &SecretStore, body: &mut Vec<u8>, host: &str) -> Result<(), String> {
    if !secrets.contains_any_placeholder(body) {
        return Ok(());
    }
    match secrets.substitute(body, host) {
        Ok(substituted) => {
            *body = substituted;
            Ok(())
        }
        Err(placeholder) => Err(placeholder),
    }
}

fn substitute_headers(secrets: &SecretStore, headers: &mut [(String, String)], host: &str) -> Result<(), String> {
    for (_, v) in headers.iter_mut() {
        if secrets.contains_any_placeholder(v.as_bytes()) {
            let substituted = secrets.substitute(v.as_bytes(), host)?;
            *v = String::from_utf8_lossy(&substituted).into_owned();
        }
    }
    Ok(())
}

fn substitute_path(secrets: &SecretStore, path: &mut String, host: &str) -> Result<(), String> {
    if secrets.contains_any_placeholder(path.as_bytes()) {
        let substituted = secrets.substitute(path.as_bytes(), host)?;
        *path = String::from_utf8_lossy(&substituted).into_owned();
    }
    Ok(())
}

fn substitute_query(secrets: &SecretStore, query: &mut std::collections::BTreeMap<String, String>, host: &str) -> Result<(), String> {
    for v in query.values_mut() {
        if secrets.contains_any_placeholder(v.as_bytes()) {
            let substituted = secrets.substitute(v.as_bytes(), host)?;
            *v = String::from_utf8_lossy(&substituted).into_owned();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_upstream_returns_a_loopback_address_for_localhost() {
        let (addr, ip) = resolve_upstream("localhost", 80).await.unwrap();
        assert_eq!(addr.ip(), ip);
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn resolve_upstream_reports_unresolvable_hosts() {
        let err = resolve_upstream("this-host-does-not-resolve.invalid", 80).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn read_full_chunked_reassembles_a_body_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let written = b"3\r\nfoo\r\n4\r\nbarz\r\n0\r\n\r\n".to_vec();
        tokio::spawn(async move {
            client.write_all(&written).await.unwrap();
        });
        let (body, remainder) = read_full_chunked(&mut server, &[]).await.unwrap();
        assert_eq!(body, b"foobarz");
        assert!(remainder.is_empty());
    }

    #[tokio::test]
    async fn read_full_chunked_keeps_pipelined_remainder() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            client.write_all(b"2\r\nhi\r\n0\r\n\r\nGET / HTTP/1.1\r\n").await.unwrap();
        });
        let (body, remainder) = read_full_chunked(&mut server, &[]).await.unwrap();
        assert_eq!(body, b"hi");
        assert_eq!(remainder, b"GET / HTTP/1.1\r\n");
    }
}
