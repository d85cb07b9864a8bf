//! Policy Engine (C4): host matching, secret placeholder mapping, and
//! private-IP blocking, composed behind a single facade the interception
//! stack consults per connection.

mod allowlist;
mod secrets;

pub use allowlist::{AllowList, HostPattern};
pub use secrets::{SecretSpec, SecretStore};

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDecision {
    Allow,
    Deny,
}

/// Whether an IP address falls in RFC1918, link-local, or loopback space.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.octets()[0] == 100 && (64..128).contains(&v4.octets()[1])
        }
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

pub struct PolicyEngine {
    allow_list: AllowList,
    secrets: SecretStore,
    block_private_ips: bool,
    allowed_private_hosts: Vec<String>,
}

pub struct PolicyConfig {
    pub initial_allow_list: Vec<String>,
    pub secrets: Vec<SecretSpec>,
    pub block_private_ips: bool,
    pub allowed_private_hosts: Vec<String>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            allow_list: AllowList::new(config.initial_allow_list),
            secrets: SecretStore::new(config.secrets),
            block_private_ips: config.block_private_ips,
            allowed_private_hosts: config.allowed_private_hosts,
        }
    }

    /// `host` is the hostname as observed (SNI, `Host:` header, or
    /// pre-NAT destination for passthrough). `resolved_ip`, if the caller
    /// already resolved it, is checked against `block_private_ips`.
    pub fn match_host(&self, host: &str, resolved_ip: Option<IpAddr>) -> HostDecision {
        if !self.allow_list.allows_host(host) {
            return HostDecision::Deny;
        }
        if self.block_private_ips {
            if let Some(ip) = resolved_ip {
                let literal_allowed = self
                    .allowed_private_hosts
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(host));
                if is_private_ip(ip) && !literal_allowed {
                    return HostDecision::Deny;
                }
            }
        }
        HostDecision::Allow
    }

    pub fn placeholders(&self) -> HashMap<String, String> {
        self.secrets.placeholders()
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn add_allowed_hosts(&self, hosts: &[String]) -> Vec<String> {
        self.allow_list.add(hosts)
    }

    pub fn remove_allowed_hosts(&self, hosts: &[String]) -> Vec<String> {
        self.allow_list.delete(hosts)
    }

    pub fn allowed_hosts(&self) -> Vec<String> {
        self.allow_list.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(allow: Vec<&str>) -> PolicyEngine {
        PolicyEngine::new(PolicyConfig {
            initial_allow_list: allow.into_iter().map(String::from).collect(),
            secrets: Vec::new(),
            block_private_ips: true,
            allowed_private_hosts: Vec::new(),
        })
    }

    #[test]
    fn denies_host_not_on_list() {
        let e = engine(vec!["example.com"]);
        assert_eq!(e.match_host("httpbin.org", None), HostDecision::Deny);
        assert_eq!(e.match_host("example.com", None), HostDecision::Allow);
    }

    #[test]
    fn blocks_private_ip_unless_literal_allowed() {
        let e = PolicyEngine::new(PolicyConfig {
            initial_allow_list: vec!["internal.local".into()],
            secrets: Vec::new(),
            block_private_ips: true,
            allowed_private_hosts: vec!["internal.local".into()],
        });
        let private_ip = "10.1.2.3".parse().unwrap();
        assert_eq!(e.match_host("internal.local", Some(private_ip)), HostDecision::Allow);

        let e2 = engine(vec!["other.local"]);
        assert_eq!(e2.match_host("other.local", Some(private_ip)), HostDecision::Deny);
    }

    #[test]
    fn allow_list_mutation_is_idempotent() {
        let e = engine(vec![]);
        let added = e.add_allowed_hosts(&["x.com".to_string()]);
        assert_eq!(added, vec!["x.com".to_string()]);
        let added_again = e.add_allowed_hosts(&["x.com".to_string()]);
        assert!(added_again.is_empty());
    }
}
