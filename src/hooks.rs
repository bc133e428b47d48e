// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::{Arc, RwLock};

/// Receiver side of a utilization event.
pub trait UtilHandler: Send + Sync {
    fn util_update(&self, now_us: u64);
}

/// Per-CPU utilization hook registry.
///
/// The runtime drives `util_update` from its scheduler-event path with a
/// monotonic timestamp; an armed hook runs the admission gate for that CPU.
/// Invocation holds the slot's read lock, so `disarm` (a write acquisition)
/// doubles as the barrier Stop needs: it returns only once no invocation of
/// the old hook is still in flight.
pub struct UtilHooks {
    slots: Vec<RwLock<Option<Arc<dyn UtilHandler>>>>,
}

impl UtilHooks {
    pub fn new(nr_cpu_ids: usize) -> Self {
        let mut slots = Vec::with_capacity(nr_cpu_ids);
        slots.resize_with(nr_cpu_ids, || RwLock::new(None));
        Self { slots }
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn arm(&self, cpu: usize, handler: Arc<dyn UtilHandler>) {
        *self.slots[cpu].write().unwrap() = Some(handler);
    }

    pub(crate) fn disarm(&self, cpu: usize) {
        *self.slots[cpu].write().unwrap() = None;
    }

    /// Entry point for the runtime's utilization events. Unknown CPUs and
    /// disarmed slots are ignored.
    pub fn util_update(&self, cpu: usize, now_us: u64) {
        let Some(slot) = self.slots.get(cpu) else {
            return;
        };
        if let Some(handler) = slot.read().unwrap().as_ref() {
            handler.util_update(now_us);
        }
    }

    pub fn is_armed(&self, cpu: usize) -> bool {
        self.slots
            .get(cpu)
            .map(|slot| slot.read().unwrap().is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingHandler {
        hits: AtomicU64,
        last_now: AtomicU64,
    }

    impl UtilHandler for CountingHandler {
        fn util_update(&self, now_us: u64) {
            self.hits.fetch_add(1, Ordering::AcqRel);
            self.last_now.store(now_us, Ordering::Release);
        }
    }

    #[test]
    fn test_arm_dispatch_disarm() {
        let hooks = UtilHooks::new(2);
        let handler = Arc::new(CountingHandler {
            hits: AtomicU64::new(0),
            last_now: AtomicU64::new(0),
        });

        // Nothing armed yet.
        hooks.util_update(0, 10);
        assert_eq!(handler.hits.load(Ordering::Acquire), 0);

        hooks.arm(0, handler.clone());
        assert!(hooks.is_armed(0));
        hooks.util_update(0, 42);
        hooks.util_update(1, 43);
        assert_eq!(handler.hits.load(Ordering::Acquire), 1);
        assert_eq!(handler.last_now.load(Ordering::Acquire), 42);

        hooks.disarm(0);
        assert!(!hooks.is_armed(0));
        hooks.util_update(0, 44);
        assert_eq!(handler.hits.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_out_of_range_cpu_ignored() {
        let hooks = UtilHooks::new(1);
        hooks.util_update(7, 10);
        assert!(!hooks.is_armed(7));
    }
}
