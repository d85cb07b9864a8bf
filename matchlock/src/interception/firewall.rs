//! Packet-redirection glue.
//!
//! The supervisor installs rules on create and tears them down on close;
//! this module defines the contract rather than a concrete `iptables`/`pf`
//! implementation, the same way `vmm::traits` leaves the hypervisor as an
//! external collaborator.

use async_trait::async_trait;
use matchlock_shared::MatchlockResult;

/// Ports the interception stack listens on; guest egress TCP is steered
/// here by firewall rules.
pub const HTTP_PORT: u16 = 18080;
pub const HTTPS_PORT: u16 = 18443;
pub const PASSTHROUGH_PORT: u16 = 18999;
pub const DNS_PORT: u16 = 15353;

/// One sandbox's redirection rules: steer `subnet_cidr`'s egress TCP on
/// port 80 to `HTTP_PORT`, port 443 to `HTTPS_PORT`, everything else TCP
/// to `PASSTHROUGH_PORT`, and UDP 53 to the local DNS proxy.
#[derive(Debug, Clone)]
pub struct FirewallRules {
    pub vm_id: String,
    pub subnet_cidr: String,
    pub gateway_ip: std::net::Ipv4Addr,
}

/// Installs/removes the host-side packet redirection for one sandbox.
/// Creation aborts if `install` fails; `remove` is best-effort and
/// reported to the lifecycle journal rather than propagated.
#[async_trait]
pub trait FirewallController: Send + Sync {
    async fn install(&self, rules: &FirewallRules) -> MatchlockResult<()>;

    async fn remove(&self, rules: &FirewallRules) -> MatchlockResult<()>;
}

/// No-op controller for platforms/tests where packet redirection is
/// handled out of band (e.g. a test harness that dials the proxy ports
/// directly instead of through guest NAT).
pub struct NoopFirewall;

#[async_trait]
impl FirewallController for NoopFirewall {
    async fn install(&self, _rules: &FirewallRules) -> MatchlockResult<()> {
        Ok(())
    }

    async fn remove(&self, _rules: &FirewallRules) -> MatchlockResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_firewall_always_succeeds() {
        let fw = NoopFirewall;
        let rules = FirewallRules {
            vm_id: "vm-0011223344556677".into(),
            subnet_cidr: "10.100.0.0/24".into(),
            gateway_ip: "10.100.0.1".parse().unwrap(),
        };
        fw.install(&rules).await.unwrap();
        fw.remove(&rules).await.unwrap();
    }
}
