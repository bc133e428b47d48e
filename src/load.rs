// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::sample::{CpuTimesSource, SampleTable};

pub(crate) fn sub_or_zero(curr: u64, prev: u64) -> u64 {
    curr.checked_sub(prev).unwrap_or(0)
}

/// Compute the aggregate load of a domain over the window that ended now.
///
/// For every CPU the counters are advanced to the current readings and the
/// window deltas derived. CPUs with an empty or skewed window
/// (`wall_delta == 0` or `idle_delta > wall_delta`) contribute nothing.
/// With `ignore_nice`, time burned by low-priority tasks counts as idle.
///
/// A wall delta much larger than the effective sampling interval means the
/// CPU slept through entire windows and a task just woke it; computing load
/// over that stretch would report near zero no matter how hot the waking
/// task is. The previously stored load stands in for this one round and is
/// then zeroed, so a second consecutive long gap computes fresh.
///
/// The aggregate is the maximum over the contributing CPUs: the shared
/// frequency has to satisfy the worst-loaded member.
pub(crate) fn aggregate_load(
    cpus: &[usize],
    table: &SampleTable,
    times: &dyn CpuTimesSource,
    effective_rate_us: u64,
    ignore_nice: bool,
    io_busy: bool,
) -> u32 {
    let mut max_load = 0;

    for &cpu in cpus {
        let cur = times.cpu_times(cpu, io_busy);
        let mut slot = table.slot(cpu).lock().unwrap();

        let wall_delta = sub_or_zero(cur.wall_us, slot.prev_wall_us);
        slot.prev_wall_us = cur.wall_us;

        let mut idle_delta = sub_or_zero(cur.idle_us, slot.prev_idle_us);
        slot.prev_idle_us = cur.idle_us;

        if ignore_nice {
            idle_delta += sub_or_zero(cur.nice_us, slot.prev_nice_us);
            slot.prev_nice_us = cur.nice_us;
        }

        if wall_delta == 0 || idle_delta > wall_delta {
            continue;
        }

        let load = if wall_delta > 2 * effective_rate_us && slot.prev_load != 0 {
            let load = slot.prev_load;
            // Destructive read: the stand-in value is used exactly once.
            slot.prev_load = 0;
            load
        } else {
            let load = (100 * (wall_delta - idle_delta) / wall_delta) as u32;
            slot.prev_load = load;
            load
        };

        if load > max_load {
            max_load = load;
        }
    }

    max_load
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::CpuTimes;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeTimes {
        now: Mutex<HashMap<usize, CpuTimes>>,
    }

    impl FakeTimes {
        fn new() -> Self {
            Self {
                now: Mutex::new(HashMap::new()),
            }
        }

        fn set(&self, cpu: usize, wall_us: u64, idle_us: u64, nice_us: u64) {
            self.now.lock().unwrap().insert(
                cpu,
                CpuTimes {
                    wall_us,
                    idle_us,
                    nice_us,
                },
            );
        }
    }

    impl CpuTimesSource for FakeTimes {
        fn cpu_times(&self, cpu: usize, _io_busy: bool) -> CpuTimes {
            self.now
                .lock()
                .unwrap()
                .get(&cpu)
                .copied()
                .unwrap_or_default()
        }
    }

    const RATE: u64 = 20_000;

    fn seeded(cpus: &[usize], times: &FakeTimes) -> SampleTable {
        let table = SampleTable::new(8);
        for &cpu in cpus {
            table.seed(cpu, times.cpu_times(cpu, false));
        }
        table
    }

    #[test]
    fn test_basic_load_arithmetic() {
        let times = FakeTimes::new();
        times.set(0, 0, 0, 0);
        let table = seeded(&[0], &times);

        times.set(0, 100, 40, 0);
        let load = aggregate_load(&[0], &table, &times, RATE, false, false);
        assert_eq!(load, 60);
        assert_eq!(table.prev_load(0), 60);
    }

    #[test]
    fn test_zero_wall_delta_excluded() {
        let times = FakeTimes::new();
        times.set(0, 500, 100, 0);
        times.set(1, 0, 0, 0);
        let table = seeded(&[0, 1], &times);

        // CPU 0 does not advance at all; CPU 1 runs 50% busy.
        times.set(1, 100, 50, 0);
        let load = aggregate_load(&[0, 1], &table, &times, RATE, false, false);
        assert_eq!(load, 50);
    }

    #[test]
    fn test_skewed_window_excluded() {
        let times = FakeTimes::new();
        times.set(0, 0, 0, 0);
        let table = seeded(&[0], &times);

        // Idle advanced further than wall: clock-skew window.
        times.set(0, 100, 150, 0);
        let load = aggregate_load(&[0], &table, &times, RATE, false, false);
        assert_eq!(load, 0);
    }

    #[test]
    fn test_nice_time_counts_as_idle_when_ignored() {
        let times = FakeTimes::new();
        times.set(0, 0, 0, 0);
        let table = seeded(&[0], &times);

        // 100us window, 40us idle, 30us of it nice-busy.
        times.set(0, 100, 40, 30);
        let load = aggregate_load(&[0], &table, &times, RATE, true, false);
        assert_eq!(load, 30);
    }

    #[test]
    fn test_idle_gap_reuses_prev_load_exactly_once() {
        let times = FakeTimes::new();
        times.set(0, 0, 0, 0);
        let table = seeded(&[0], &times);

        // A normal window stores load 70.
        times.set(0, 100, 30, 0);
        assert_eq!(aggregate_load(&[0], &table, &times, RATE, false, false), 70);

        // Long idle gap: 3x the sampling rate, fully idle. The stored 70
        // stands in and is consumed.
        let gap = 3 * RATE;
        times.set(0, 100 + gap, 30 + gap, 0);
        assert_eq!(aggregate_load(&[0], &table, &times, RATE, false, false), 70);
        assert_eq!(table.prev_load(0), 0);

        // A second consecutive long gap computes fresh: 0 when idle
        // throughout.
        times.set(0, 100 + 2 * gap, 30 + 2 * gap, 0);
        assert_eq!(aggregate_load(&[0], &table, &times, RATE, false, false), 0);
    }

    #[test]
    fn test_aggregate_is_max_over_cpus() {
        let times = FakeTimes::new();
        for cpu in 0..4 {
            times.set(cpu, 0, 0, 0);
        }
        let table = seeded(&[0, 1, 2, 3], &times);

        times.set(0, 100, 40, 0); // 60
        times.set(1, 100, 10, 0); // 90
        times.set(2, 100, 100, 0); // 0
        times.set(3, 100, 50, 0); // 50
        let load = aggregate_load(&[0, 1, 2, 3], &table, &times, RATE, false, false);
        assert_eq!(load, 90);
    }
}
