//! Process-wide `/24` subnet allocator.
//!
//! Carves a fixed pool (default `10.100.0.0/16`, 256 disjoint `/24`s) into
//! one lease per sandbox: every running networked sandbox owns exactly one
//! lease, and release is idempotent.

use matchlock_shared::{ErrorKind, MatchlockError, MatchlockResult, SandboxId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// A single allocated `/24` bound to one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetLease {
    pub vm_id: SandboxId,
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub subnet_cidr: String,
    octet3: u8,
}

impl SubnetLease {
    pub fn subnet_cidr(&self) -> &str {
        &self.subnet_cidr
    }
}

struct Inner {
    base: [u8; 2],
    next: u16,
    free: Vec<u8>,
    leased: HashMap<SandboxId, u8>,
}

/// Allocates and releases `/24` leases out of `base.0.base.1.0.0/16`.
///
/// Tests construct their own allocator rather than reaching for a process
/// global, per the injectable-dependency guidance for this component.
#[derive(Clone)]
pub struct SubnetAllocator {
    inner: Arc<Mutex<Inner>>,
}

impl SubnetAllocator {
    pub fn new() -> Self {
        Self::with_base([10, 100])
    }

    pub fn with_base(base: [u8; 2]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                base,
                next: 0,
                free: Vec::new(),
                leased: HashMap::new(),
            })),
        }
    }

    /// Allocate the next free `/24` for `vm_id`. Fails with `kind=Subnet`
    /// once the 256-subnet pool is exhausted.
    pub fn allocate(&self, vm_id: &SandboxId) -> MatchlockResult<SubnetLease> {
        let mut inner = self.inner.lock();

        if inner.leased.contains_key(vm_id) {
            return Err(MatchlockError::Subnet(format!(
                "sandbox {vm_id} already holds a subnet lease"
            )));
        }

        let octet3 = if let Some(reused) = inner.free.pop() {
            reused
        } else if inner.next <= u8::MAX as u16 {
            let value = inner.next as u8;
            inner.next += 1;
            value
        } else {
            return Err(MatchlockError::Subnet(
                "subnet pool exhausted (256 /24s in use)".into(),
            ));
        };

        inner.leased.insert(vm_id.clone(), octet3);

        let [b0, b1] = inner.base;
        Ok(SubnetLease {
            vm_id: vm_id.clone(),
            gateway_ip: Ipv4Addr::new(b0, b1, octet3, 1),
            guest_ip: Ipv4Addr::new(b0, b1, octet3, 2),
            subnet_cidr: format!("{b0}.{b1}.{octet3}.0/24"),
            octet3,
        })
    }

    /// Release a lease. Idempotent: releasing an id with no active lease
    /// is not an error.
    pub fn release(&self, vm_id: &SandboxId) {
        let mut inner = self.inner.lock();
        if let Some(octet3) = inner.leased.remove(vm_id) {
            inner.free.push(octet3);
        }
    }

    pub fn is_leased(&self, vm_id: &SandboxId) -> bool {
        self.inner.lock().leased.contains_key(vm_id)
    }
}

impl Default for SubnetAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> SandboxId {
        SandboxId::parse(&format!("vm-{:016x}", n)).unwrap()
    }

    #[test]
    fn leases_are_disjoint() {
        let alloc = SubnetAllocator::new();
        let a = alloc.allocate(&id(1)).unwrap();
        let b = alloc.allocate(&id(2)).unwrap();
        assert_ne!(a.subnet_cidr, b.subnet_cidr);
        assert_ne!(a.gateway_ip, b.gateway_ip);
        assert_ne!(a.guest_ip, b.guest_ip);
    }

    #[test]
    fn release_is_idempotent_and_frees_for_reuse() {
        let alloc = SubnetAllocator::new();
        let vm = id(3);
        let lease = alloc.allocate(&vm).unwrap();
        alloc.release(&vm);
        alloc.release(&vm);
        assert!(!alloc.is_leased(&vm));

        let reused = alloc.allocate(&id(4)).unwrap();
        assert_eq!(reused.subnet_cidr, lease.subnet_cidr);
    }

    #[test]
    fn double_allocate_same_vm_fails() {
        let alloc = SubnetAllocator::new();
        let vm = id(5);
        alloc.allocate(&vm).unwrap();
        let err = alloc.allocate(&vm).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Subnet);
    }

    #[test]
    fn pool_exhaustion_fails_with_subnet_kind() {
        let alloc = SubnetAllocator::new();
        for n in 0..256u32 {
            let vm_id = SandboxId::parse(&format!("vm-{:016x}", n)).unwrap();
            alloc.allocate(&vm_id).unwrap();
        }
        let one_more = SandboxId::parse(&format!("vm-{:016x}", 256)).unwrap();
        let err = alloc.allocate(&one_more).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Subnet);
    }
}
