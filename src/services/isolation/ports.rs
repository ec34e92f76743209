//! Deterministic port pair allocation.
//!
//! Each execution id hashes to a preferred slot in a small pool. A slot is
//! handed out only when no live execution holds it and both ports bind on
//! loopback; otherwise the following slots are tried in order.

use std::collections::HashMap;
use std::net::TcpListener;

use sha2::{Digest, Sha256};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ExecutionId, PortPair};

#[derive(Debug)]
pub struct PortPool {
    size: u16,
    primary_base: u16,
    secondary_base: u16,
    reserved: HashMap<ExecutionId, u16>,
    check_free: bool,
}

impl PortPool {
    pub fn new(size: u16, primary_base: u16, secondary_base: u16) -> Self {
        Self {
            size,
            primary_base,
            secondary_base,
            reserved: HashMap::new(),
            check_free: true,
        }
    }

    /// Skip the loopback bind check.
    pub fn without_port_check(mut self) -> Self {
        self.check_free = false;
        self
    }

    /// Slot an execution id prefers.
    pub fn preferred_offset(id: &ExecutionId, size: u16) -> u16 {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let hash = u64::from_be_bytes(head);
        u16::try_from(hash % u64::from(size.max(1))).unwrap_or(0)
    }

    fn pair_at(&self, offset: u16) -> Option<PortPair> {
        Some(PortPair {
            primary: self.primary_base.checked_add(offset)?,
            secondary: self.secondary_base.checked_add(offset)?,
        })
    }

    /// Reserve a pair for `id`; the same id keeps its pair until released.
    pub fn allocate(&mut self, id: &ExecutionId) -> DomainResult<PortPair> {
        if let Some(pair) = self.reserved.get(id).and_then(|off| self.pair_at(*off)) {
            return Ok(pair);
        }

        let start = Self::preferred_offset(id, self.size);
        for step in 0..self.size {
            let offset = u16::try_from((u32::from(start) + u32::from(step)) % u32::from(self.size))
                .unwrap_or(0);
            if self.reserved.values().any(|taken| *taken == offset) {
                continue;
            }
            let Some(pair) = self.pair_at(offset) else {
                continue;
            };
            if self.check_free && !(port_is_free(pair.primary) && port_is_free(pair.secondary)) {
                tracing::debug!(
                    primary = pair.primary,
                    secondary = pair.secondary,
                    "port pair busy on host, trying next slot"
                );
                continue;
            }
            self.reserved.insert(id.clone(), offset);
            return Ok(pair);
        }

        Err(DomainError::PortPoolExhausted {
            pool_size: self.size,
        })
    }

    /// Free the pair held by `id`. Returns whether anything was held.
    pub fn release(&mut self, id: &ExecutionId) -> bool {
        self.reserved.remove(id).is_some()
    }

    pub fn holder_of(&self, id: &ExecutionId) -> Option<PortPair> {
        self.reserved.get(id).and_then(|off| self.pair_at(*off))
    }

    pub fn in_use(&self) -> usize {
        self.reserved.len()
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ExecutionId {
        ExecutionId::parse(s).unwrap()
    }

    #[test]
    fn test_same_id_same_pair() {
        let mut pool = PortPool::new(15, 41000, 42000).without_port_check();
        let first = pool.allocate(&id("a1b2c3d4")).unwrap();
        let again = pool.allocate(&id("a1b2c3d4")).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.secondary - 42000, first.primary - 41000);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_allocation_is_deterministic_across_pools() {
        let a = PortPool::new(15, 41000, 42000)
            .without_port_check()
            .allocate(&id("deadbeef"))
            .unwrap();
        let b = PortPool::new(15, 41000, 42000)
            .without_port_check()
            .allocate(&id("deadbeef"))
            .unwrap();
        assert_eq!(a, b);
        let offset = PortPool::preferred_offset(&id("deadbeef"), 15);
        assert_eq!(a.primary, 41000 + offset);
    }

    #[test]
    fn test_live_executions_never_share() {
        let mut pool = PortPool::new(3, 41000, 42000).without_port_check();
        let pairs: Vec<PortPair> = ["aaaaaaaa", "bbbbbbbb", "cccccccc"]
            .iter()
            .map(|s| pool.allocate(&id(s)).unwrap())
            .collect();
        assert_ne!(pairs[0], pairs[1]);
        assert_ne!(pairs[1], pairs[2]);
        assert_ne!(pairs[0], pairs[2]);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let mut pool = PortPool::new(2, 41000, 42000).without_port_check();
        pool.allocate(&id("aaaaaaaa")).unwrap();
        pool.allocate(&id("bbbbbbbb")).unwrap();

        let err = pool.allocate(&id("cccccccc")).unwrap_err();
        assert!(matches!(err, DomainError::PortPoolExhausted { pool_size: 2 }));
        assert!(err.is_fatal());

        assert!(pool.release(&id("aaaaaaaa")));
        assert!(!pool.release(&id("aaaaaaaa")));
        assert!(pool.allocate(&id("cccccccc")).is_ok());
    }

    #[test]
    fn test_port_check_skips_bound_ports() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let mut pool = PortPool::new(1, taken, taken.saturating_sub(1));
        let err = pool.allocate(&id("a1b2c3d4")).unwrap_err();
        assert!(matches!(err, DomainError::PortPoolExhausted { .. }));
    }
}
