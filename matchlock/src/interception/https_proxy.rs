//! Transparent HTTPS MITM proxy.
//!
//! Accepts a guest TCP connection, sniffs the ClientHello's SNI without
//! completing the handshake, resolves it to the address that will actually
//! be dialed, consults the policy engine by host and resolved IP (so
//! `block_private_ips` applies to hostnames, not just IP literals), mints
//! (or fetches) a leaf cert for that SNI, completes a server-side TLS
//! handshake with the guest, then opens an upstream TLS connection to the
//! resolved address and pipes HTTP/1.1 request/response pairs through the
//! rule pipeline.
//! Connections that negotiate an ALPN other than `http/1.1` would bypass
//! rule application; this proxy only offers `http/1.1` to the guest, so
//! every intercepted connection takes the parsed path.

use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::{Acceptor, ServerConfig as RustlsServerConfig};
use rustls::ClientConfig as RustlsClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use crate::policy::{HostDecision, PolicyEngine};

use super::ca::CaPool;
use super::proxy_pipe::{pipe_http_over, resolve_upstream};
use super::rules::RulePipeline;

pub struct HttpsProxy {
    ca: Arc<CaPool>,
    policy: Arc<PolicyEngine>,
    rules: Arc<RulePipeline>,
    upstream_root_store: Arc<rustls::RootCertStore>,
}

impl HttpsProxy {
    pub fn new(ca: Arc<CaPool>, policy: Arc<PolicyEngine>, rules: Arc<RulePipeline>) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            ca,
            policy,
            rules,
            upstream_root_store: Arc::new(root_store),
        }
    }

    pub fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "HTTPS accept failed; retrying");
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle(stream, peer).await {
                        tracing::debug!(error = %e, peer = %peer, "HTTPS connection ended with error");
                    }
                });
            }
        })
    }

    async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) -> Result<(), String> {
        let mut acceptor = Acceptor::default();
        let accepted = loop {
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.map_err(|e| e.to_string())?;
            if n == 0 {
                return Ok(());
            }
            acceptor
                .read_tls(&mut &buf[..n])
                .map_err(|e| format!("reading ClientHello: {e}"))?;
            if let Some(accepted) = acceptor.accept().map_err(|e| format!("parsing ClientHello: {e}"))? {
                break accepted;
            }
        };

        let sni = accepted
            .client_hello()
            .server_name()
            .map(|s| s.to_string())
            .ok_or_else(|| "ClientHello carried no SNI".to_string())?;

        let (upstream_addr, resolved_ip) = resolve_upstream(&sni, 443).await?;

        if self.policy.match_host(&sni, Some(resolved_ip)) != HostDecision::Allow {
            tracing::info!(host = %sni, "HTTPS connection denied by policy");
            return Ok(());
        }

        let (chain, key_der) = self.ca.chain_for_sni(&sni).map_err(|e| e.to_string())?;
        let cert_chain: Vec<CertificateDer<'static>> = chain.into_iter().map(CertificateDer::from).collect();
        let key = PrivatePkcs8KeyDer::from(key_der);

        let mut server_config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key.into())
            .map_err(|e| format!("building server TLS config for {sni}: {e}"))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let conn = accepted
            .into_connection(Arc::new(server_config))
            .map_err(|(e, _)| format!("completing TLS handshake with guest for {sni}: {e}"))?;
        let mut guest_tls = tokio_rustls::server::TlsStream::new(stream, conn.into());

        let mut client_config = RustlsClientConfig::builder()
            .with_root_certificates((*self.upstream_root_store).clone())
            .with_no_client_auth();
        client_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let connector = TlsConnector::from(Arc::new(client_config));

        let upstream_tcp = TcpStream::connect(upstream_addr)
            .await
            .map_err(|e| format!("dialing upstream {upstream_addr} ({sni}:443): {e}"))?;
        let server_name = ServerName::try_from(sni.clone()).map_err(|e| format!("invalid upstream SNI {sni}: {e}"))?;
        let upstream_tls = connector
            .connect(server_name, upstream_tcp)
            .await
            .map_err(|e| format!("upstream TLS handshake with {sni}: {e}"))?;

        pipe_http_over(&mut guest_tls, upstream_tls, &sni, &self.policy, &self.rules, Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_generated_ca() {
        let ca = Arc::new(CaPool::generate().unwrap());
        let policy = Arc::new(PolicyEngine::new(crate::policy::PolicyConfig {
            initial_allow_list: vec![],
            secrets: vec![],
            block_private_ips: false,
            allowed_private_hosts: vec![],
        }));
        let rules = Arc::new(RulePipeline::new(vec![], None));
        let _proxy = HttpsProxy::new(ca, policy, rules);
    }
}
