//! Transparent plain-HTTP proxy: analogous to
//! the HTTPS proxy without a TLS handshake on either side. The `Host:`
//! header (not SNI) identifies the destination, resolved to an address
//! before the policy check so `block_private_ips` applies here too.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::policy::PolicyEngine;

use super::http::{header_value, parse_request_headers};
use super::proxy_pipe::{pipe_http_over, resolve_upstream};
use super::rules::RulePipeline;

const MAX_HEADER_BYTES: usize = 64 * 1024;

pub struct HttpProxy {
    policy: Arc<PolicyEngine>,
    rules: Arc<RulePipeline>,
}

impl HttpProxy {
    pub fn new(policy: Arc<PolicyEngine>, rules: Arc<RulePipeline>) -> Self {
        Self { policy, rules }
    }

    pub fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "HTTP accept failed; retrying");
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle(stream, peer).await {
                        tracing::debug!(error = %e, peer = %peer, "HTTP connection ended with error");
                    }
                });
            }
        })
    }

    async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) -> Result<(), String> {
        let mut header_buf = Vec::new();
        let host = loop {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
            if n == 0 {
                return Ok(());
            }
            header_buf.extend_from_slice(&chunk[..n]);
            if header_buf.len() > MAX_HEADER_BYTES {
                return Err("request header block too large".into());
            }
            if let Some(parsed) = parse_request_headers(&header_buf).map_err(|e| e.to_string())? {
                let Some(host_header) = header_value(&parsed.headers, "host") else {
                    return Err("request carried no Host header".into());
                };
                break host_header.split(':').next().unwrap_or(host_header).to_string();
            }
        };

        let (upstream_addr, resolved_ip) = resolve_upstream(&host, 80).await?;

        if self.policy.match_host(&host, Some(resolved_ip)) != crate::policy::HostDecision::Allow {
            tracing::info!(host, "HTTP connection denied by policy");
            return Ok(());
        }

        let upstream = TcpStream::connect(upstream_addr)
            .await
            .map_err(|e| format!("dialing upstream {upstream_addr} ({host}:80): {e}"))?;

        pipe_http_over(&mut stream, upstream, &host, &self.policy, &self.rules, header_buf).await
    }
}
