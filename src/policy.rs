// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::Domain;
use crate::sample::{CpuTimesSource, SampleTable};
use crate::tunables::TunableSet;

/// Per-domain control state, alive from attach to detach.
///
/// The window fields are plain atomics so the admission gate stays lock-free
/// and allocation-free. The timer lock serializes the decision routine,
/// tunable writers and limit changes against each other; the gate never
/// takes it.
pub struct PolicyState {
    domain: Arc<Domain>,
    tunables: Arc<TunableSet>,
    table: Arc<SampleTable>,

    /// Base sample delay in us; the gate widens it by `rate_mult`.
    sample_delay_us: AtomicU64,
    last_sample_time: AtomicU64,
    rate_mult: AtomicU32,
    work_in_progress: AtomicBool,
    /// Admission counter, 0 or 1 per window.
    work_count: AtomicU32,
    is_shared: AtomicBool,

    timer: Mutex<()>,
}

impl PolicyState {
    pub(crate) fn new(
        domain: Arc<Domain>,
        tunables: Arc<TunableSet>,
        table: Arc<SampleTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain,
            tunables,
            table,
            sample_delay_us: AtomicU64::new(0),
            last_sample_time: AtomicU64::new(0),
            rate_mult: AtomicU32::new(1),
            work_in_progress: AtomicBool::new(false),
            work_count: AtomicU32::new(0),
            is_shared: AtomicBool::new(false),
            timer: Mutex::new(()),
        })
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn tunables(&self) -> &Arc<TunableSet> {
        &self.tunables
    }

    pub(crate) fn table(&self) -> &SampleTable {
        &self.table
    }

    pub(crate) fn timer_lock(&self) -> MutexGuard<'_, ()> {
        self.timer.lock().unwrap()
    }

    /// Admission gate, run per CPU on every utilization event.
    ///
    /// Returns true for exactly one caller per sampling window; the caller
    /// then signals the worker. Must stay O(1), non-blocking and
    /// non-allocating: this runs adjacent to scheduler code.
    pub fn admit(&self, now_us: u64) -> bool {
        // A dispatch is already queued or running.
        if self.work_in_progress.load(Ordering::Acquire) {
            return false;
        }

        // Pairs with the release fence in finish_sample() so the delay and
        // timestamp read below are at least as fresh as the flag above.
        fence(Ordering::Acquire);

        let lst = self.last_sample_time.load(Ordering::Acquire);
        let delta = now_us.wrapping_sub(lst);
        let effective =
            self.sample_delay_us.load(Ordering::Acquire) * self.rate_mult.load(Ordering::Acquire) as u64;
        if delta < effective {
            return false;
        }

        if self.is_shared.load(Ordering::Relaxed) {
            // Single-winner admission: increment the counter only from zero.
            if self
                .work_count
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }

            // Another CPU advanced the window between our reads; revert the
            // admission rather than dispatch twice.
            if lst != self.last_sample_time.load(Ordering::Acquire) {
                self.work_count.store(0, Ordering::Release);
                return false;
            }
        }

        self.last_sample_time.store(now_us, Ordering::Release);
        self.work_in_progress.store(true, Ordering::Release);
        true
    }

    /// Reopen the sampling window after a decision ran.
    ///
    /// The caller has already stored the new base delay. The counter reset
    /// and the fence must precede the flag clear: a CPU admitted right after
    /// must observe the fresh delay and timestamp, which weakly-ordered
    /// machines only guarantee with the explicit fence.
    pub(crate) fn finish_sample(&self) {
        self.work_count.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        self.work_in_progress.store(false, Ordering::Release);
    }

    /// Force the window closed. Only used once all sampling activity has
    /// been cancelled.
    pub(crate) fn reset_window(&self) {
        self.work_count.store(0, Ordering::Release);
        self.work_in_progress.store(false, Ordering::Release);
    }

    pub fn sample_delay_us(&self) -> u64 {
        self.sample_delay_us.load(Ordering::Acquire)
    }

    pub(crate) fn set_base_delay(&self, delay_us: u64) {
        self.sample_delay_us.store(delay_us, Ordering::Release);
    }

    pub fn last_sample_time(&self) -> u64 {
        self.last_sample_time.load(Ordering::Acquire)
    }

    pub(crate) fn reset_last_sample_time(&self) {
        self.last_sample_time.store(0, Ordering::Release);
    }

    /// Temporary widening factor for the sampling interval, owned by the
    /// governor variant's decision function.
    pub fn rate_mult(&self) -> u32 {
        self.rate_mult.load(Ordering::Acquire)
    }

    pub fn set_rate_mult(&self, mult: u32) {
        self.rate_mult.store(mult.max(1), Ordering::Release);
    }

    pub fn work_in_progress(&self) -> bool {
        self.work_in_progress.load(Ordering::Acquire)
    }

    pub fn pending_admissions(&self) -> u32 {
        self.work_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_is_shared(&self, shared: bool) {
        self.is_shared.store(shared, Ordering::Relaxed);
    }

    pub fn is_shared(&self) -> bool {
        self.is_shared.load(Ordering::Relaxed)
    }

    /// Re-baseline every member CPU under the timer lock, excluding a
    /// concurrent decision routine. Used when time-accounting tunables flip
    /// mid-flight.
    pub(crate) fn reseed_baselines(&self, times: &dyn CpuTimesSource, io_busy: bool) {
        let _timer = self.timer_lock();
        for &cpu in self.domain.cpus() {
            self.table.seed(cpu, times.cpu_times(cpu, io_busy));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::tunables::TunableSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn test_policy(cpus: Vec<usize>, shared: bool) -> Arc<PolicyState> {
        let domain = Arc::new(Domain::new(0, cpus, 1_000_000, 500_000, 2_000_000, 1_000_000));
        let tunables = Arc::new(TunableSet::from_latency(1_000_000, 0));
        let table = Arc::new(SampleTable::new(8));
        let policy = PolicyState::new(domain, tunables, table);
        policy.set_base_delay(20_000);
        policy.set_is_shared(shared);
        policy
    }

    #[test]
    fn test_too_early_sample_dropped() {
        let policy = test_policy(vec![0], false);
        assert!(policy.admit(100_000));
        policy.finish_sample();
        // Window reopened, but not enough time elapsed.
        assert!(!policy.admit(100_001));
        assert!(policy.admit(120_000));
    }

    #[test]
    fn test_work_in_progress_blocks_admission() {
        let policy = test_policy(vec![0], false);
        assert!(policy.admit(100_000));
        assert!(policy.work_in_progress());
        assert!(!policy.admit(200_000));
        policy.finish_sample();
        assert!(policy.admit(200_000));
    }

    #[test]
    fn test_rate_mult_widens_window() {
        let policy = test_policy(vec![0], false);
        assert!(policy.admit(100_000));
        policy.set_rate_mult(4);
        policy.finish_sample();
        // One base delay is no longer enough.
        assert!(!policy.admit(120_000));
        assert!(policy.admit(180_000));
    }

    #[test]
    fn test_shared_single_winner_under_contention() {
        for _ in 0..50 {
            let policy = test_policy(vec![0, 1, 2, 3], true);
            let admitted = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..4 {
                let policy = policy.clone();
                let admitted = admitted.clone();
                handles.push(thread::spawn(move || {
                    if policy.admit(1_000_000) {
                        admitted.fetch_add(1, Ordering::AcqRel);
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(admitted.load(Ordering::Acquire), 1);
            assert!(policy.work_in_progress());
            assert_eq!(policy.pending_admissions(), 1);
        }
    }

    #[test]
    fn test_losers_drop_out_after_window_advances() {
        let policy = test_policy(vec![0, 1], true);
        assert!(policy.admit(1_000_000));
        // Same-window stragglers are dropped on the in-progress check.
        assert!(!policy.admit(1_000_000));
        assert!(!policy.admit(1_000_500));
    }

    #[test]
    fn test_reset_window_clears_flags() {
        let policy = test_policy(vec![0, 1], true);
        assert!(policy.admit(1_000_000));
        policy.reset_window();
        assert!(!policy.work_in_progress());
        assert_eq!(policy.pending_admissions(), 0);
    }
}
