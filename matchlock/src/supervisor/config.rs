//! `Config`, `Mount`, and the nested network/VFS/image configuration types.

use matchlock_shared::{MatchlockError, MatchlockResult};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::interception::NetworkHookRule;
use crate::policy::SecretSpec;
use crate::vfs::VfsHookRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    Memory,
    HostFs,
    Overlay,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MountSpec {
    pub guest_path: String,
    pub mount_type: MountType,
    pub host_path: Option<PathBuf>,
    pub readonly: bool,
}

impl MountSpec {
    /// Overlay mounts require `host_path`; there is no explicit
    /// `upper`/`lower` config surface.
    fn validate(&self) -> MatchlockResult<()> {
        if !self.guest_path.starts_with('/') {
            return Err(MatchlockError::Config(format!(
                "mount guest_path {:?} must be absolute",
                self.guest_path
            )));
        }
        if matches!(self.mount_type, MountType::Overlay) && self.host_path.is_none() {
            return Err(MatchlockError::Config(format!(
                "overlay mount at {:?} requires host_path",
                self.guest_path
            )));
        }
        if matches!(self.mount_type, MountType::HostFs) && self.host_path.is_none() {
            return Err(MatchlockError::Config(format!(
                "hostfs mount at {:?} requires host_path",
                self.guest_path
            )));
        }
        Ok(())
    }

    fn cleaned_guest_path(&self) -> String {
        let trimmed = self.guest_path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Validate a full mount set: absolute, cleaned, distinct guest paths;
/// per-mount invariants.
pub fn validate_mounts(mounts: &[MountSpec]) -> MatchlockResult<()> {
    let mut seen = std::collections::BTreeSet::new();
    for mount in mounts {
        mount.validate()?;
        let cleaned = mount.cleaned_guest_path();
        if !seen.insert(cleaned.clone()) {
            return Err(MatchlockError::Config(format!(
                "duplicate mount guest_path {cleaned:?}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub add_hosts: Vec<(String, std::net::Ipv4Addr)>,
    #[serde(default)]
    pub dns_servers: Vec<std::net::Ipv4Addr>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub block_private_ips: bool,
    #[serde(default)]
    pub allowed_private_hosts: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,
    #[serde(default)]
    pub force_interception: bool,
    #[serde(default)]
    pub interception_rules: Vec<NetworkHookRule>,
    #[serde(default)]
    pub callback_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecretConfig {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl From<SecretConfig> for SecretSpec {
    fn from(s: SecretConfig) -> Self {
        SecretSpec {
            name: s.name,
            value: s.value,
            allowed_hosts: s.allowed_hosts,
        }
    }
}

impl NetworkConfig {
    fn needs_interception(&self) -> bool {
        self.force_interception || !self.secrets.is_empty() || !self.interception_rules.is_empty()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct VfsConfig {
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    pub workspace_path: String,
    #[serde(default)]
    pub interception_rules: Vec<VfsHookRule>,
    #[serde(default)]
    pub emit_events: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ImageConfig {
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub image: String,
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub memory_mb: u32,
    #[serde(default)]
    pub disk_size_mb: u32,
    #[serde(default)]
    pub no_network: bool,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub vfs: VfsConfig,
    #[serde(default)]
    pub extra_disks: Vec<PathBuf>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub image_config: ImageConfig,
}

impl Config {
    /// Top-level validation run before any resource is touched: mount
    /// shape and the `no_network` mutual-exclusion invariant.
    pub fn validate(&self) -> MatchlockResult<()> {
        validate_mounts(&self.vfs.mounts)?;

        if self.no_network {
            let conflicts = !self.network.allowed_hosts.is_empty()
                || !self.network.secrets.is_empty()
                || self.network.force_interception
                || !self.network.interception_rules.is_empty();
            if conflicts {
                return Err(MatchlockError::Config(
                    "no_network=true is mutually exclusive with allow-list, secrets, force_interception, or interception rules".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn needs_interception(&self) -> bool {
        !self.no_network && self.network.needs_interception()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            image: "alpine:latest".into(),
            cpu_count: 1,
            memory_mb: 512,
            disk_size_mb: 1024,
            no_network: false,
            network: NetworkConfig::default(),
            vfs: VfsConfig::default(),
            extra_disks: Vec::new(),
            privileged: false,
            image_config: ImageConfig::default(),
        }
    }

    #[test]
    fn no_network_conflicts_with_allow_list() {
        let mut cfg = base_config();
        cfg.no_network = true;
        cfg.network.allowed_hosts = vec!["example.com".into()];
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }

    #[test]
    fn no_network_conflicts_with_secrets() {
        let mut cfg = base_config();
        cfg.no_network = true;
        cfg.network.secrets = vec![SecretConfig {
            name: "X".into(),
            value: "y".into(),
            allowed_hosts: vec![],
        }];
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }

    #[test]
    fn overlay_mount_without_host_path_is_rejected() {
        let mut cfg = base_config();
        cfg.vfs.mounts = vec![MountSpec {
            guest_path: "/data".into(),
            mount_type: MountType::Overlay,
            host_path: None,
            readonly: false,
        }];
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }

    #[test]
    fn duplicate_guest_paths_are_rejected() {
        let mut cfg = base_config();
        cfg.vfs.mounts = vec![
            MountSpec {
                guest_path: "/data".into(),
                mount_type: MountType::Memory,
                host_path: None,
                readonly: false,
            },
            MountSpec {
                guest_path: "/data/".into(),
                mount_type: MountType::Memory,
                host_path: None,
                readonly: false,
            },
        ];
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }

    #[test]
    fn plain_config_is_valid() {
        base_config().validate().unwrap();
    }
}
