//! Composes the CA pool, both HTTP(S) proxies, the passthrough proxy and
//! the DNS proxy into one long-lived service per sandbox.

use matchlock_shared::{MatchlockError, MatchlockResult};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::policy::PolicyEngine;

use super::ca::CaPool;
use super::dns::DnsProxy;
use super::firewall::{DNS_PORT, HTTP_PORT, HTTPS_PORT, PASSTHROUGH_PORT};
use super::http_proxy::HttpProxy;
use super::https_proxy::HttpsProxy;
use super::passthrough::{NoDestinationResolver, OriginalDestinationResolver, PassthroughProxy};
use super::rules::{NetworkHookRule, RulePipeline};

pub struct InterceptionConfig {
    pub rules: Vec<NetworkHookRule>,
    pub callback_socket: Option<std::path::PathBuf>,
    pub dns_upstreams: Vec<SocketAddr>,
    pub bind_ip: IpAddr,
    pub destination_resolver: Option<Arc<dyn OriginalDestinationResolver>>,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            callback_socket: None,
            dns_upstreams: vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            ],
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            destination_resolver: None,
        }
    }
}

/// One sandbox's interception stack: every listener task spawned here is
/// owned by the returned handle and stopped on `shutdown`.
pub struct InterceptionStack {
    pub ca: Arc<CaPool>,
    rules: Arc<RulePipeline>,
    dns: Arc<DnsProxy>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl InterceptionStack {
    /// Generate a fresh CA pool without binding any listeners yet. The
    /// root cert is injected into the guest rootfs before the VM starts
    ///, which must happen before `start` binds ports.
    pub fn prepare() -> MatchlockResult<Arc<CaPool>> {
        Ok(Arc::new(CaPool::generate()?))
    }

    /// Bind and spawn every listener. Listen failures abort creation
    /// rather than leaving a sandbox half-networked.
    pub async fn start(ca: Arc<CaPool>, policy: Arc<PolicyEngine>, config: InterceptionConfig) -> MatchlockResult<Self> {
        let rules = Arc::new(RulePipeline::new(
            config
                .rules
                .into_iter()
                .inspect(|r| {
                    if let Err(e) = r.validate() {
                        tracing::warn!(rule = %r.name, error = %e, "invalid network hook rule");
                    }
                })
                .collect(),
            config.callback_socket,
        ));

        let http_listener = bind_tcp(config.bind_ip, HTTP_PORT).await?;
        let https_listener = bind_tcp(config.bind_ip, HTTPS_PORT).await?;
        let passthrough_listener = bind_tcp(config.bind_ip, PASSTHROUGH_PORT).await?;

        let http_proxy = Arc::new(HttpProxy::new(policy.clone(), rules.clone()));
        let https_proxy = Arc::new(HttpsProxy::new(ca.clone(), policy.clone(), rules.clone()));
        let resolver = config.destination_resolver.unwrap_or_else(|| Arc::new(NoDestinationResolver));
        let passthrough_proxy = Arc::new(PassthroughProxy::new(policy.clone(), resolver));

        let mut tasks = Vec::new();
        tasks.push(http_proxy.spawn_accept_loop(http_listener));
        tasks.push(https_proxy.spawn_accept_loop(https_listener));
        tasks.push(passthrough_proxy.spawn_accept_loop(passthrough_listener));

        let dns = Arc::new(DnsProxy::new(config.dns_upstreams));
        let dns_bind = SocketAddr::new(config.bind_ip, DNS_PORT);
        tasks.extend(dns.spawn(dns_bind).await?);

        Ok(Self {
            ca,
            rules,
            dns,
            tasks,
        })
    }

    pub fn rules(&self) -> &Arc<RulePipeline> {
        &self.rules
    }

    /// Stop accepting new connections; in-flight connections are allowed
    /// to finish their current request.
    pub fn shutdown(&self) {
        self.dns.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind_tcp(ip: IpAddr, port: u16) -> MatchlockResult<TcpListener> {
    let addr = SocketAddr::new(ip, port);
    TcpListener::bind(addr)
        .await
        .map_err(|e| MatchlockError::Network(format!("binding interception listener on {addr}: {e}")))
}
