//! Passive data-port pool.
//!
//! A bitset over the configured `[start, end]` range. Allocation scans for
//! the first free port from a rolling cursor under one mutex; the returned
//! lease releases its port on drop, which ties the port's lifetime to the
//! passive listener holding it (transfer end, abort, handshake timeout or
//! session close all drop the lease).

use std::sync::{Arc, Mutex};

struct PoolInner {
    start: u16,
    in_use: Vec<bool>,
    cursor: usize,
    allocated: usize,
}

/// Shared pool, one per server.
pub struct PassivePortPool {
    inner: Mutex<PoolInner>,
}

impl PassivePortPool {
    pub fn new(start: u16, end: u16) -> Arc<Self> {
        let size = usize::from(end.saturating_sub(start)) + 1;
        Arc::new(PassivePortPool {
            inner: Mutex::new(PoolInner {
                start,
                in_use: vec![false; size],
                cursor: 0,
                allocated: 0,
            }),
        })
    }

    /// First free port from the rolling cursor; `None` when exhausted.
    pub fn allocate(self: &Arc<Self>) -> Option<PortLease> {
        let mut inner = self.inner.lock().expect("port pool lock");
        let size = inner.in_use.len();
        for step in 0..size {
            let idx = (inner.cursor + step) % size;
            if !inner.in_use[idx] {
                inner.in_use[idx] = true;
                inner.cursor = (idx + 1) % size;
                inner.allocated += 1;
                let port = inner.start + idx as u16;
                return Some(PortLease { pool: self.clone(), port });
            }
        }
        None
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().expect("port pool lock").allocated
    }

    fn release(&self, port: u16) {
        let mut inner = self.inner.lock().expect("port pool lock");
        let idx = usize::from(port - inner.start);
        debug_assert!(inner.in_use[idx]);
        inner.in_use[idx] = false;
        inner.allocated -= 1;
    }
}

/// Exclusive hold on one passive port.
pub struct PortLease {
    pool: Arc<PassivePortPool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_two_leases_share_a_port() {
        let pool = PassivePortPool::new(50000, 50003);
        let leases: Vec<PortLease> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        let mut ports: Vec<u16> = leases.iter().map(|l| l.port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn dropping_a_lease_frees_its_port() {
        let pool = PassivePortPool::new(50000, 50000);
        let lease = pool.allocate().unwrap();
        assert_eq!(lease.port(), 50000);
        assert!(pool.allocate().is_none());
        drop(lease);
        assert_eq!(pool.allocated(), 0);
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn cursor_rolls_forward() {
        let pool = PassivePortPool::new(50000, 50002);
        let first = pool.allocate().unwrap();
        assert_eq!(first.port(), 50000);
        drop(first);
        // The freed port is skipped until the cursor wraps.
        let second = pool.allocate().unwrap();
        assert_eq!(second.port(), 50001);
    }
}
