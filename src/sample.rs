// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Mutex;

use crate::error::{GovError, Result};

/// Cumulative per-CPU time counters, in microseconds.
///
/// `wall_us` and `idle_us` are monotonic since some fixed origin; `nice_us`
/// is the busy time attributed to low-priority tasks. Whether iowait counts
/// as idle is the source's call, steered by the `io_busy` flag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub wall_us: u64,
    pub idle_us: u64,
    pub nice_us: u64,
}

/// Per-CPU time source supplied by the runtime.
pub trait CpuTimesSource: Send + Sync {
    fn cpu_times(&self, cpu: usize, io_busy: bool) -> CpuTimes;
}

/// Rolling sample state for one CPU: the counters observed at the previous
/// window boundary plus the last computed load (consumed by the idle-gap
/// heuristic).
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuSample {
    pub prev_wall_us: u64,
    pub prev_idle_us: u64,
    pub prev_nice_us: u64,
    pub prev_load: u32,
}

/// Fixed-size table of per-CPU sample slots, indexed by CPU id.
///
/// Sized once by the runtime for the number of possible CPU ids; domains
/// naming a CPU beyond the table fail to attach. Slots are individually
/// locked: the decision routine walks its domain's slots under the domain
/// timer lock, while start/online reseeding touches single slots.
pub struct SampleTable {
    slots: Vec<Mutex<CpuSample>>,
}

impl SampleTable {
    pub fn new(nr_cpu_ids: usize) -> Self {
        let mut slots = Vec::with_capacity(nr_cpu_ids);
        slots.resize_with(nr_cpu_ids, || Mutex::new(CpuSample::default()));
        Self { slots }
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.slots.len()
    }

    pub fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.slots.len() {
            return Err(GovError::NoCapacity {
                cpu,
                nr_cpu_ids: self.slots.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn slot(&self, cpu: usize) -> &Mutex<CpuSample> {
        &self.slots[cpu]
    }

    /// Reset a CPU's window baseline to the given counters. The stored load
    /// is zeroed so the next window computes fresh.
    pub fn seed(&self, cpu: usize, times: CpuTimes) {
        let mut slot = self.slots[cpu].lock().unwrap();
        slot.prev_wall_us = times.wall_us;
        slot.prev_idle_us = times.idle_us;
        slot.prev_nice_us = times.nice_us;
        slot.prev_load = 0;
    }

    pub fn clear(&self, cpu: usize) {
        *self.slots[cpu].lock().unwrap() = CpuSample::default();
    }

    pub fn prev_load(&self, cpu: usize) -> u32 {
        self.slots[cpu].lock().unwrap().prev_load
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_cpu_range() {
        let table = SampleTable::new(4);
        assert!(table.check_cpu(3).is_ok());
        match table.check_cpu(4) {
            Err(GovError::NoCapacity { cpu, nr_cpu_ids }) => {
                assert_eq!(cpu, 4);
                assert_eq!(nr_cpu_ids, 4);
            }
            other => panic!("expected NoCapacity, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_seed_resets_prev_load() {
        let table = SampleTable::new(2);
        {
            let mut slot = table.slot(1).lock().unwrap();
            slot.prev_load = 70;
        }
        table.seed(
            1,
            CpuTimes {
                wall_us: 1000,
                idle_us: 400,
                nice_us: 10,
            },
        );
        let slot = table.slot(1).lock().unwrap();
        assert_eq!(slot.prev_wall_us, 1000);
        assert_eq!(slot.prev_idle_us, 400);
        assert_eq!(slot.prev_nice_us, 10);
        assert_eq!(slot.prev_load, 0);
    }
}
