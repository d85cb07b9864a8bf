//! Passthrough proxy for non-HTTP TCP: forwards
//! arbitrary bytes after a policy host-check, where the host is the
//! pre-NAT original destination recorded by the firewall rather than
//! anything sniffed from the stream itself.

use matchlock_shared::MatchlockResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::policy::{HostDecision, PolicyEngine};

/// Resolves the pre-NAT original destination for a passthrough
/// connection accepted on the redirect port. On Linux this would read
/// `SO_ORIGINAL_DST`; abstracted so platforms/tests can supply their own
/// mapping.
pub trait OriginalDestinationResolver: Send + Sync {
    fn resolve(&self, peer: SocketAddr) -> Option<SocketAddr>;
}

/// Resolver that has no NAT table to consult; every connection is denied
/// unless a test or a simpler platform wires up a real one.
pub struct NoDestinationResolver;

impl OriginalDestinationResolver for NoDestinationResolver {
    fn resolve(&self, _peer: SocketAddr) -> Option<SocketAddr> {
        None
    }
}

pub struct PassthroughProxy {
    policy: Arc<PolicyEngine>,
    resolver: Arc<dyn OriginalDestinationResolver>,
}

impl PassthroughProxy {
    pub fn new(policy: Arc<PolicyEngine>, resolver: Arc<dyn OriginalDestinationResolver>) -> Self {
        Self { policy, resolver }
    }

    pub fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "passthrough accept failed; retrying");
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle(stream, peer).await {
                        tracing::debug!(error = %e, "passthrough connection ended with error");
                    }
                });
            }
        })
    }

    async fn handle(&self, mut guest: TcpStream, peer: SocketAddr) -> MatchlockResult<()> {
        let Some(dest) = self.resolver.resolve(peer) else {
            return Ok(());
        };

        let host = dest.ip().to_string();
        if self.policy.match_host(&host, Some(dest.ip())) != HostDecision::Allow {
            tracing::info!(host, "passthrough connection denied by policy");
            return Ok(());
        }

        let mut upstream = TcpStream::connect(dest).await?;
        let (mut gr, mut gw) = guest.split();
        let (mut ur, mut uw) = upstream.split();
        let client_to_upstream = tokio::io::copy(&mut gr, &mut uw);
        let upstream_to_client = tokio::io::copy(&mut ur, &mut gw);
        tokio::select! {
            r = client_to_upstream => { r?; }
            r = upstream_to_client => { r?; }
        }
        Ok(())
    }
}
