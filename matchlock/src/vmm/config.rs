//! `VmConfig`: everything the backend needs to create a `Machine`.

use matchlock_shared::{MatchlockError, MatchlockResult};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    Ext4,
    Squashfs,
    Erofs,
}

/// One immutable lower image in the rootfs stack.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiskLayer {
    pub path: PathBuf,
    pub fs_type: FsType,
    pub readonly: bool,
}

/// `bootstrap` base disk + writable `upper` overlay disk + ordered immutable
/// `lowers`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RootfsLayout {
    pub bootstrap: DiskLayer,
    pub upper: DiskLayer,
    pub lowers: Vec<DiskLayer>,
}

impl RootfsLayout {
    /// Total devices this layout contributes: bootstrap + upper + lowers.
    pub fn device_count(&self) -> usize {
        2 + self.lowers.len()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    pub kernel_path: PathBuf,
    pub initramfs_path: Option<PathBuf>,
    pub rootfs: RootfsLayout,
    pub extra_disks: Vec<DiskLayer>,
    pub cpu_count: u32,
    pub memory_mb: u32,
    pub gateway_ip: Option<Ipv4Addr>,
    pub guest_ip: Option<Ipv4Addr>,
    pub subnet_cidr: Option<String>,
    pub workspace: PathBuf,
    pub hostname: String,
    pub dns_servers: Vec<Ipv4Addr>,
    pub add_hosts: Vec<(String, Ipv4Addr)>,
    pub mtu: u32,
    pub privileged: bool,
    pub no_network: bool,
}

pub const MAX_BLOCK_DEVICES: usize = 24;
pub const MAX_LOWER_IMAGES: usize = 20;

impl VmConfig {
    /// Block-device count and layering boundary checks; must fail with
    /// `kind=Config` before any VM is created, never surfaced as a
    /// backend error.
    pub fn validate(&self) -> MatchlockResult<()> {
        if self.rootfs.lowers.len() > MAX_LOWER_IMAGES {
            return Err(MatchlockError::Config(format!(
                "rootfs declares {} lower images, exceeding the {} limit",
                self.rootfs.lowers.len(),
                MAX_LOWER_IMAGES
            )));
        }

        let total = self.rootfs.device_count() + self.extra_disks.len();
        if total > MAX_BLOCK_DEVICES {
            return Err(MatchlockError::Config(format!(
                "sandbox declares {total} block devices, exceeding the {MAX_BLOCK_DEVICES} limit"
            )));
        }

        if self.no_network && (self.gateway_ip.is_some() || self.guest_ip.is_some()) {
            return Err(MatchlockError::Config(
                "no_network=true is incompatible with a gateway/guest IP assignment".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> DiskLayer {
        DiskLayer {
            path: PathBuf::from(name),
            fs_type: FsType::Ext4,
            readonly: true,
        }
    }

    fn base_config() -> VmConfig {
        VmConfig {
            kernel_path: PathBuf::from("/boot/vmlinux"),
            initramfs_path: None,
            rootfs: RootfsLayout {
                bootstrap: layer("bootstrap.ext4"),
                upper: DiskLayer {
                    path: PathBuf::from("upper.ext4"),
                    fs_type: FsType::Ext4,
                    readonly: false,
                },
                lowers: Vec::new(),
            },
            extra_disks: Vec::new(),
            cpu_count: 1,
            memory_mb: 512,
            gateway_ip: None,
            guest_ip: None,
            subnet_cidr: None,
            workspace: PathBuf::from("/workspace"),
            hostname: "sandbox".into(),
            dns_servers: Vec::new(),
            add_hosts: Vec::new(),
            mtu: 1500,
            privileged: false,
            no_network: true,
        }
    }

    #[test]
    fn rejects_too_many_lowers() {
        let mut cfg = base_config();
        cfg.rootfs.lowers = (0..21).map(|i| layer(&format!("lower-{i}"))).collect();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }

    #[test]
    fn rejects_too_many_block_devices() {
        let mut cfg = base_config();
        cfg.rootfs.lowers = (0..20).map(|i| layer(&format!("lower-{i}"))).collect();
        cfg.extra_disks = (0..3).map(|i| layer(&format!("extra-{i}"))).collect();
        // bootstrap + upper + 20 lowers + 3 extras = 25 > 24
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }

    #[test]
    fn accepts_boundary_device_count() {
        let mut cfg = base_config();
        cfg.rootfs.lowers = (0..20).map(|i| layer(&format!("lower-{i}"))).collect();
        cfg.extra_disks = (0..2).map(|i| layer(&format!("extra-{i}"))).collect();
        // bootstrap + upper + 20 lowers + 2 extras = 24, exactly at the limit
        cfg.validate().unwrap();
    }

    #[test]
    fn no_network_rejects_ip_assignment() {
        let mut cfg = base_config();
        cfg.no_network = true;
        cfg.gateway_ip = Some(Ipv4Addr::new(10, 0, 0, 1));
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
    }
}
