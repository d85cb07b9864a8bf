//! Ordered host-pattern allow-list with runtime mutation.
//!
//! Reads take the lock per connection decision; writes are serialized,
//! so allow-list updates are linearizable: every connection accepted
//! after a write observes the new state.

use parking_lot::RwLock;
use std::collections::BTreeSet;

/// A single allow-list entry: an exact host, a `*.`-prefixed wildcard
/// domain, a literal IP, or a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostPattern {
    Exact(String),
    WildcardDomain(String),
    Ip(std::net::IpAddr),
    Cidr(ipnet::IpNet),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Self {
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return HostPattern::WildcardDomain(suffix.to_ascii_lowercase());
        }
        if let Ok(net) = pattern.parse::<ipnet::IpNet>() {
            return HostPattern::Cidr(net);
        }
        if let Ok(ip) = pattern.parse::<std::net::IpAddr>() {
            return HostPattern::Ip(ip);
        }
        HostPattern::Exact(pattern.to_ascii_lowercase())
    }

    fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match self {
            HostPattern::Exact(pat) => *pat == host,
            HostPattern::WildcardDomain(suffix) => {
                host == *suffix || host.ends_with(&format!(".{suffix}"))
            }
            HostPattern::Ip(ip) => host.parse::<std::net::IpAddr>().map(|h| h == *ip).unwrap_or(false),
            HostPattern::Cidr(net) => host
                .parse::<std::net::IpAddr>()
                .map(|h| net.contains(&h))
                .unwrap_or(false),
        }
    }

    fn matches_ip(&self, ip: std::net::IpAddr) -> bool {
        match self {
            HostPattern::Ip(pat) => *pat == ip,
            HostPattern::Cidr(net) => net.contains(&ip),
            _ => false,
        }
    }

    fn as_str(&self) -> String {
        match self {
            HostPattern::Exact(s) => s.clone(),
            HostPattern::WildcardDomain(s) => format!("*.{s}"),
            HostPattern::Ip(ip) => ip.to_string(),
            HostPattern::Cidr(net) => net.to_string(),
        }
    }
}

/// Empty list means "permit all".
pub struct AllowList {
    entries: RwLock<BTreeSet<String>>,
    patterns: RwLock<Vec<HostPattern>>,
}

impl AllowList {
    pub fn new(initial_hosts: Vec<String>) -> Self {
        let list = Self {
            entries: RwLock::new(BTreeSet::new()),
            patterns: RwLock::new(Vec::new()),
        };
        for h in initial_hosts {
            list.insert(h);
        }
        list
    }

    fn insert(&self, host: String) -> bool {
        let inserted = self.entries.write().insert(host.clone());
        if inserted {
            self.patterns.write().push(HostPattern::parse(&host));
        }
        inserted
    }

    fn remove(&self, host: &str) -> bool {
        let removed = self.entries.write().remove(host);
        if removed {
            self.patterns.write().retain(|p| p.as_str() != host);
        }
        removed
    }

    /// Empty list ⇒ permit all.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn allows_host(&self, host: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        self.patterns.read().iter().any(|p| p.matches_host(host))
    }

    pub fn allows_ip(&self, ip: std::net::IpAddr) -> bool {
        if self.is_empty() {
            return true;
        }
        self.patterns.read().iter().any(|p| p.matches_ip(ip))
    }

    /// Returns the hosts that were newly added (idempotent: a host already
    /// present is omitted from the result).
    pub fn add(&self, hosts: &[String]) -> Vec<String> {
        hosts
            .iter()
            .filter(|h| self.insert((*h).clone()))
            .cloned()
            .collect()
    }

    /// Returns the hosts that were actually removed.
    pub fn delete(&self, hosts: &[String]) -> Vec<String> {
        hosts
            .iter()
            .filter(|h| self.remove(h))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_permits_all() {
        let list = AllowList::new(Vec::new());
        assert!(list.allows_host("anything.example.com"));
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let list = AllowList::new(vec!["*.example.com".into()]);
        assert!(list.allows_host("api.example.com"));
        assert!(list.allows_host("example.com"));
        assert!(!list.allows_host("evil.com"));
    }

    #[test]
    fn add_is_idempotent() {
        let list = AllowList::new(vec!["a.com".into()]);
        let added_again = list.add(&["a.com".to_string()]);
        assert!(added_again.is_empty());
        assert_eq!(list.list(), vec!["a.com".to_string()]);
    }

    #[test]
    fn add_then_delete_round_trip() {
        let list = AllowList::new(Vec::new());
        let added = list.add(&["b.com".to_string()]);
        assert_eq!(added, vec!["b.com".to_string()]);
        assert!(list.allows_host("b.com"));

        let removed = list.delete(&["b.com".to_string()]);
        assert_eq!(removed, vec!["b.com".to_string()]);
        assert!(list.allows_host("b.com") == false || list.is_empty());
    }

    #[test]
    fn cidr_blocks_private_ip() {
        let list = AllowList::new(vec!["10.0.0.0/8".into()]);
        assert!(list.allows_ip("10.1.2.3".parse().unwrap()));
        assert!(!list.allows_ip("8.8.8.8".parse().unwrap()));
    }
}
