//! Fixed-size pool of worker slots.
//!
//! The pool is the only mutable state shared between the request path, the
//! repair tasks and the shutdown controller. Slots are replaced in place and
//! never added or removed, so slot indices stay valid for the lifetime of
//! the process and the round-robin cursor can index the pool directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::worker::{WorkerInstance, WorkerState};

/// Returned by [`Pool::replace`] once the pool has been closed for shutdown.
///
/// Carries back the instance that was not installed so the caller can stop it.
#[derive(Debug)]
pub struct PoolClosed(pub WorkerInstance);

#[derive(Debug)]
struct Slots {
    instances: Vec<WorkerInstance>,
    closed: bool,
}

/// Ordered, fixed-length collection of worker slots.
#[derive(Debug)]
pub struct Pool {
    slots: RwLock<Slots>,
    /// One flag per slot, set while a repair cycle owns the slot.
    repairing: Vec<AtomicBool>,
}

impl Pool {
    /// Create a pool from the bootstrapped instances, one per slot.
    pub fn new(instances: Vec<WorkerInstance>) -> Self {
        let repairing = instances.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            slots: RwLock::new(Slots {
                instances,
                closed: false,
            }),
            repairing,
        }
    }

    /// Number of slots. Constant for the lifetime of the pool.
    pub fn size(&self) -> usize {
        self.repairing.len()
    }

    /// Snapshot of the instance at `index`.
    pub fn get(&self, index: usize) -> Option<WorkerInstance> {
        self.slots.read().instances.get(index).cloned()
    }

    /// Snapshot of every slot, in slot order.
    pub fn snapshot(&self) -> Vec<WorkerInstance> {
        self.slots.read().instances.clone()
    }

    /// Install `instance` at `index`, returning the instance it replaced.
    ///
    /// Readers observe either the old or the new instance, never a mix.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] with the rejected instance once [`close`](Self::close)
    /// has run.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range; slot indices come from the pool
    /// itself, so this is a programming error.
    pub fn replace(
        &self,
        index: usize,
        instance: WorkerInstance,
    ) -> Result<WorkerInstance, PoolClosed> {
        let mut slots = self.slots.write();
        assert!(
            index < slots.instances.len(),
            "slot {index} out of range for pool of {}",
            slots.instances.len()
        );
        if slots.closed {
            return Err(PoolClosed(instance));
        }
        Ok(std::mem::replace(&mut slots.instances[index], instance))
    }

    /// Update the state of the slot at `index`.
    ///
    /// Ignored after [`close`](Self::close), which owns the final state.
    pub fn set_state(&self, index: usize, state: WorkerState) {
        let mut slots = self.slots.write();
        if slots.closed {
            return;
        }
        if let Some(instance) = slots.instances.get_mut(index) {
            instance.state = state;
        }
    }

    /// Close the pool for shutdown.
    ///
    /// Marks every slot `Terminating` and returns the instances to stop.
    /// After this, `replace` and `set_state` no longer change the pool.
    pub fn close(&self) -> Vec<WorkerInstance> {
        let mut slots = self.slots.write();
        slots.closed = true;
        for instance in &mut slots.instances {
            instance.state = WorkerState::Terminating;
        }
        slots.instances.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.slots.read().closed
    }

    /// Claim the slot at `index` for a repair cycle.
    ///
    /// Returns `None` if a repair already owns the slot (or the index is out
    /// of range). The claim is released when the returned guard drops.
    pub fn try_begin_repair(self: &Arc<Self>, index: usize) -> Option<RepairClaim> {
        let flag = self.repairing.get(index)?;
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(RepairClaim {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Whether a repair cycle currently owns the slot.
    pub fn is_repairing(&self, index: usize) -> bool {
        self.repairing
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

/// Exclusive right to repair one slot.
#[derive(Debug)]
pub struct RepairClaim {
    pool: Arc<Pool>,
    index: usize,
}

impl RepairClaim {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for RepairClaim {
    fn drop(&mut self) {
        self.pool.repairing[self.index].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::proxy::ProxyFactory;
    use crate::cluster::worker::{RuntimeHandle, WorkerSpec};
    use proptest::prelude::*;
    use std::time::Duration;

    fn instance(port: u16, handle: &str) -> WorkerInstance {
        let spec = Arc::new(WorkerSpec {
            name: format!("nginx-{port}"),
            host_port: port,
            container_port: 80,
            image: "nginx:latest".to_string(),
            mount: None,
        });
        let proxy = ProxyFactory::new(Duration::from_secs(1))
            .build(&spec)
            .unwrap();
        WorkerInstance::running(spec, RuntimeHandle::new(handle), proxy)
    }

    fn pool_of(n: u16) -> Arc<Pool> {
        Arc::new(Pool::new(
            (0..n)
                .map(|i| instance(3001 + i, &format!("c{i}")))
                .collect(),
        ))
    }

    #[test]
    fn test_pool_get_and_size() {
        let pool = pool_of(2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.get(0).unwrap().spec.host_port, 3001);
        assert_eq!(pool.get(1).unwrap().handle.as_str(), "c1");
        assert!(pool.get(2).is_none());
    }

    #[test]
    fn test_pool_replace_in_place() {
        let pool = pool_of(3);
        let old = pool.replace(1, instance(3002, "c1-new")).unwrap();

        assert_eq!(old.handle.as_str(), "c1");
        assert_eq!(pool.get(1).unwrap().handle.as_str(), "c1-new");
        assert_eq!(pool.get(0).unwrap().handle.as_str(), "c0");
        assert_eq!(pool.get(2).unwrap().handle.as_str(), "c2");
        assert_eq!(pool.size(), 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_pool_replace_out_of_range_panics() {
        let pool = pool_of(2);
        let _ = pool.replace(2, instance(3003, "c2"));
    }

    #[test]
    fn test_pool_set_state() {
        let pool = pool_of(2);
        pool.set_state(0, WorkerState::Failed);
        assert_eq!(pool.get(0).unwrap().state, WorkerState::Failed);
        assert_eq!(pool.get(1).unwrap().state, WorkerState::Running);
    }

    #[test]
    fn test_pool_close_rejects_replace() {
        let pool = pool_of(2);
        let closing = pool.close();

        assert_eq!(closing.len(), 2);
        assert!(closing.iter().all(|i| i.state == WorkerState::Terminating));
        assert!(pool.is_closed());

        let PoolClosed(rejected) = pool.replace(0, instance(3001, "late")).unwrap_err();
        assert_eq!(rejected.handle.as_str(), "late");
        assert_eq!(pool.get(0).unwrap().handle.as_str(), "c0");

        pool.set_state(0, WorkerState::Running);
        assert_eq!(pool.get(0).unwrap().state, WorkerState::Terminating);
    }

    #[test]
    fn test_repair_claim_is_exclusive_per_slot() {
        let pool = pool_of(2);

        let claim = pool.try_begin_repair(0).unwrap();
        assert_eq!(claim.index(), 0);
        assert!(pool.is_repairing(0));
        assert!(pool.try_begin_repair(0).is_none());

        // Other slots are unaffected
        let other = pool.try_begin_repair(1);
        assert!(other.is_some());

        drop(claim);
        assert!(!pool.is_repairing(0));
        assert!(pool.try_begin_repair(0).is_some());
    }

    #[test]
    fn test_repair_claim_out_of_range() {
        let pool = pool_of(1);
        assert!(pool.try_begin_repair(5).is_none());
    }

    #[test]
    fn test_concurrent_replace_and_get_never_tear() {
        let pool = pool_of(4);
        let writers: Vec<_> = (0..4u16)
            .map(|slot| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for round in 0..200 {
                        let port = 3001 + slot;
                        pool.replace(usize::from(slot), instance(port, &format!("{port}-{round}")))
                            .unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    for slot in 0..4 {
                        let inst = pool.get(slot).unwrap();
                        // Handle and spec always come from the same write
                        let port = inst.spec.host_port.to_string();
                        let handle = inst.handle.as_str();
                        assert!(handle == format!("c{slot}") || handle.starts_with(&port));
                        assert_eq!(inst.proxy.origin(), inst.spec.origin());
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(pool.size(), 4);
    }

    proptest! {
        #[test]
        fn prop_pool_size_never_changes(
            size in 1u16..8,
            ops in proptest::collection::vec((0usize..8, any::<bool>()), 0..40),
        ) {
            let pool = pool_of(size);
            for (slot, fail) in ops {
                let slot = slot % usize::from(size);
                if fail {
                    pool.set_state(slot, WorkerState::Failed);
                } else {
                    let port = 3001 + slot as u16;
                    pool.replace(slot, instance(port, "replacement")).unwrap();
                }
                prop_assert_eq!(pool.size(), usize::from(size));
                prop_assert_eq!(pool.snapshot().len(), usize::from(size));
            }
        }
    }
}
