//! Sandbox identifiers.

use rand::RngCore;
use std::fmt;

/// A sandbox identifier, `vm-<16 hex>`.
///
/// Newtype over `String` so it can't be confused with an arbitrary string
/// at call sites, while still being cheap to clone and to use as a
/// `HashMap` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    /// Generate a fresh id: `vm-` followed by 16 lowercase hex digits.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        Self(format!("vm-{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an externally-supplied id, validating the `vm-<16 hex>` shape.
    pub fn parse(s: &str) -> Option<Self> {
        let hex_part = s.strip_prefix("vm-")?;
        if hex_part.len() == 16 && hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_stable_shape() {
        let id = SandboxId::generate();
        assert!(id.as_str().starts_with("vm-"));
        assert_eq!(id.as_str().len(), 19);
        assert!(SandboxId::parse(id.as_str()).is_some());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = SandboxId::generate();
        let b = SandboxId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(SandboxId::parse("vm-short").is_none());
        assert!(SandboxId::parse("not-a-vm-id-at-all").is_none());
        assert!(SandboxId::parse("vm-zzzzzzzzzzzzzzzz").is_none());
    }
}
