//! Secret placeholder/value mapping.
//!
//! A secret's real value is never exposed to the guest; only its
//! placeholder is. `map_placeholder` is consulted by the MITM to rewrite
//! outbound bytes, scoped by the secret's authorized hosts.

use rand::RngCore;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SecretSpec {
    pub name: String,
    pub value: String,
    pub allowed_hosts: Vec<String>,
}

struct SecretEntry {
    value: String,
    allowed_hosts: Vec<String>,
}

/// Generates and holds the placeholder <-> secret mapping for one
/// sandbox. Placeholders are distinct from the real value and from every
/// other placeholder in the process.
pub struct SecretStore {
    /// placeholder -> entry
    by_placeholder: HashMap<String, SecretEntry>,
    /// name -> placeholder, for building guest environment variables.
    placeholders_by_name: HashMap<String, String>,
}

fn generate_placeholder() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("SANDBOX_SECRET_{}", hex::encode(bytes))
}

impl SecretStore {
    pub fn new(secrets: Vec<SecretSpec>) -> Self {
        let mut by_placeholder = HashMap::new();
        let mut placeholders_by_name = HashMap::new();
        for secret in secrets {
            let placeholder = generate_placeholder();
            placeholders_by_name.insert(secret.name.clone(), placeholder.clone());
            by_placeholder.insert(
                placeholder,
                SecretEntry {
                    value: secret.value,
                    allowed_hosts: secret.allowed_hosts,
                },
            );
        }
        Self {
            by_placeholder,
            placeholders_by_name,
        }
    }

    /// Stable for the life of the sandbox: `name -> placeholder`, used to
    /// build the guest's environment.
    pub fn placeholders(&self) -> HashMap<String, String> {
        self.placeholders_by_name.clone()
    }

    fn host_authorized(&self, placeholder: &str, host: &str) -> bool {
        self.by_placeholder
            .get(placeholder)
            .map(|e| {
                e.allowed_hosts
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(host))
            })
            .unwrap_or(false)
    }

    /// Scan `bytes` for every known placeholder and substitute the real
    /// value wherever the destination `host` is authorized for that
    /// secret. Returns `Err` with the unauthorized placeholder's secret
    /// name if a placeholder is seen going to a host it isn't allowed for
    /// -- callers must close the connection without forwarding any bytes.
    ///
    /// Substitution is a byte-literal, case-sensitive splice -- it never
    /// goes through `String`/UTF-8, so bytes outside the matched
    /// placeholder (including invalid UTF-8 elsewhere in the buffer) pass
    /// through untouched.
    pub fn substitute(&self, bytes: &[u8], host: &str) -> Result<Vec<u8>, String> {
        if self.by_placeholder.is_empty() {
            return Ok(bytes.to_vec());
        }
        for (placeholder, _) in &self.by_placeholder {
            if contains_bytes(bytes, placeholder.as_bytes()) && !self.host_authorized(placeholder, host) {
                return Err(placeholder.clone());
            }
        }
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        'scan: while i < bytes.len() {
            for (placeholder, entry) in &self.by_placeholder {
                let needle = placeholder.as_bytes();
                if bytes[i..].starts_with(needle) {
                    out.extend_from_slice(entry.value.as_bytes());
                    i += needle.len();
                    continue 'scan;
                }
            }
            out.push(bytes[i]);
            i += 1;
        }
        Ok(out)
    }

    /// Whether any known placeholder appears verbatim in `bytes`,
    /// regardless of destination -- used by the proxy to detect a leak
    /// attempt before it decides whether to substitute or deny.
    pub fn contains_any_placeholder(&self, bytes: &[u8]) -> bool {
        self.by_placeholder.keys().any(|p| contains_bytes(bytes, p.as_bytes()))
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_distinct_from_value() {
        let store = SecretStore::new(vec![SecretSpec {
            name: "API_KEY".into(),
            value: "sk-xyz".into(),
            allowed_hosts: vec!["httpbin.org".into()],
        }]);
        let placeholder = store.placeholders()["API_KEY"].clone();
        assert_ne!(placeholder, "sk-xyz");
        assert!(placeholder.starts_with("SANDBOX_SECRET_"));
    }

    #[test]
    fn substitutes_only_for_authorized_host() {
        let store = SecretStore::new(vec![SecretSpec {
            name: "API_KEY".into(),
            value: "sk-xyz".into(),
            allowed_hosts: vec!["httpbin.org".into()],
        }]);
        let placeholder = store.placeholders()["API_KEY"].clone();
        let body = format!("Authorization: Bearer {placeholder}");

        let substituted = store.substitute(body.as_bytes(), "httpbin.org").unwrap();
        assert!(String::from_utf8_lossy(&substituted).contains("sk-xyz"));

        let denied = store.substitute(body.as_bytes(), "evil.com");
        assert!(denied.is_err());
    }

    #[test]
    fn substitution_preserves_invalid_utf8_elsewhere() {
        let store = SecretStore::new(vec![SecretSpec {
            name: "API_KEY".into(),
            value: "sk-xyz".into(),
            allowed_hosts: vec!["httpbin.org".into()],
        }]);
        let placeholder = store.placeholders()["API_KEY"].clone();

        let mut body = b"X-Token: ".to_vec();
        body.extend_from_slice(placeholder.as_bytes());
        body.extend_from_slice(b"\r\n\xff\xfe\x00binary");

        let substituted = store.substitute(&body, "httpbin.org").unwrap();
        assert!(substituted.windows(b"sk-xyz".len()).any(|w| w == b"sk-xyz"));
        assert!(substituted.windows(6).any(|w| w == b"\xff\xfe\x00bin"));
    }
}
