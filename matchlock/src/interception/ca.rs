//! Per-sandbox CA pool: a root CA and an on-demand leaf-cert minter,
//! cached by SNI for the sandbox's lifetime.
//!
//! Never reused across sandboxes -- each `CaPool` owns its own root key,
//! so trust compromise in one sandbox can't leak into another.

use matchlock_shared::{MatchlockError, MatchlockResult};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, OffsetDateTime};

pub struct LeafCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

struct RootCa {
    cert_der: Vec<u8>,
    params: CertificateParams,
    key: KeyPair,
}

/// Mints and caches leaf certificates for SNIs observed in ClientHello.
/// The root certificate's PEM bytes are injected into the guest rootfs
/// before the VM starts.
pub struct CaPool {
    root: RootCa,
    leaf_cache: Mutex<HashMap<String, Arc<LeafCert>>>,
}

impl CaPool {
    /// Generate a fresh root CA keypair and self-signed certificate.
    pub fn generate() -> MatchlockResult<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Matchlock Sandbox CA");
        dn.push(DnType::OrganizationName, "Matchlock");
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::from_secs(3600);
        params.not_after = OffsetDateTime::now_utc() + Duration::from_secs(3600 * 24 * 365 * 5);

        let key = KeyPair::generate().map_err(|e| MatchlockError::Ca(format!("generating CA key: {e}")))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| MatchlockError::Ca(format!("self-signing CA cert: {e}")))?;
        let cert_der = cert.der().to_vec();

        Ok(Self {
            root: RootCa { cert_der, params, key },
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// PEM bytes written to `/etc/ssl/certs/matchlock-ca.crt` in the
    /// guest's writable upper rootfs before the VM is started.
    pub fn root_cert_pem(&self) -> String {
        pem_encode("CERTIFICATE", &self.root.cert_der)
    }

    /// Mint (or fetch from cache) a leaf certificate for `sni`. The SNI is
    /// both the cert's CN and its only SAN entry.
    pub fn leaf_for_sni(&self, sni: &str) -> MatchlockResult<Arc<LeafCert>> {
        if let Some(cached) = self.leaf_cache.lock().get(sni) {
            return Ok(cached.clone());
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![sni_to_san(sni)?];
        params.not_before = OffsetDateTime::now_utc() - Duration::from_secs(3600);
        params.not_after = OffsetDateTime::now_utc() + Duration::from_secs(3600 * 24 * 90);

        let leaf_key = KeyPair::generate().map_err(|e| MatchlockError::Ca(format!("generating leaf key: {e}")))?;
        let issuer = rcgen::Issuer::new(self.root.params.clone(), &self.root.key);
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| MatchlockError::Ca(format!("signing leaf cert for {sni}: {e}")))?;

        let leaf = Arc::new(LeafCert {
            cert_der: leaf_cert.der().to_vec(),
            key_der: leaf_key.serialize_der(),
        });
        self.leaf_cache.lock().insert(sni.to_string(), leaf.clone());
        Ok(leaf)
    }

    /// Full chain for a TLS handshake: `[leaf, root]`.
    pub fn chain_for_sni(&self, sni: &str) -> MatchlockResult<(Vec<Vec<u8>>, Vec<u8>)> {
        let leaf = self.leaf_for_sni(sni)?;
        Ok((vec![leaf.cert_der.clone(), self.root.cert_der.clone()], leaf.key_der.clone()))
    }
}

fn sni_to_san(sni: &str) -> MatchlockResult<SanType> {
    if let Ok(ip) = sni.parse::<std::net::IpAddr>() {
        Ok(SanType::IpAddress(ip))
    } else {
        let name = Ia5String::try_from(sni.to_string())
            .map_err(|e| MatchlockError::Ca(format!("invalid SNI for SAN {sni}: {e}")))?;
        Ok(SanType::DnsName(name))
    }
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cert_is_pem_encoded() {
        let pool = CaPool::generate().unwrap();
        let pem = pool.root_cert_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn leaf_certs_are_cached_per_sni() {
        let pool = CaPool::generate().unwrap();
        let a = pool.leaf_for_sni("example.com").unwrap();
        let b = pool.leaf_for_sni("example.com").unwrap();
        assert_eq!(a.cert_der, b.cert_der);

        let c = pool.leaf_for_sni("other.com").unwrap();
        assert_ne!(a.cert_der, c.cert_der);
    }
}
