// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{GovError, Result};
use crate::policy::PolicyState;
use crate::sample::CpuTimesSource;

/// Default sampling rate is this many times the domain's transition
/// latency.
pub const LATENCY_MULTIPLIER: u64 = 1000;
/// The sampling rate is never allowed below this many times the transition
/// latency.
pub const MIN_LATENCY_MULTIPLIER: u64 = 20;

struct MemberList {
    usage: usize,
    domains: Vec<Arc<PolicyState>>,
}

/// Reference-counted tunable configuration, shared by one or more domains
/// depending on the governor's tunable scoping.
///
/// The update lock guards only membership and the usage count. It is
/// deliberately a different lock than any domain's timer lock so a slow
/// tunable write never stalls the sampling fast path; writers take member
/// timer locks one at a time while walking the list.
pub struct TunableSet {
    sampling_rate_us: AtomicU64,
    min_sampling_rate_us: u64,
    ignore_nice: AtomicBool,
    io_is_busy: AtomicBool,
    members: Mutex<MemberList>,
}

impl TunableSet {
    /// Derive the rate floor and the initial rate from a domain's
    /// transition-latency hint. A slower-switching domain gets both a higher
    /// floor and a wider default window.
    pub(crate) fn from_latency(transition_latency_ns: u64, variant_floor_us: u64) -> Self {
        let latency_us = (transition_latency_ns / 1000).max(1);
        let min = (MIN_LATENCY_MULTIPLIER * latency_us).max(variant_floor_us);
        let rate = min.max(LATENCY_MULTIPLIER * latency_us);
        Self {
            sampling_rate_us: AtomicU64::new(rate),
            min_sampling_rate_us: min,
            ignore_nice: AtomicBool::new(false),
            io_is_busy: AtomicBool::new(false),
            members: Mutex::new(MemberList {
                usage: 0,
                domains: Vec::new(),
            }),
        }
    }

    pub(crate) fn join(&self, member: Arc<PolicyState>) {
        let mut members = self.members.lock().unwrap();
        members.usage += 1;
        members.domains.push(member);
    }

    /// Drop a member and return the remaining usage count so the caller can
    /// decide whether the set is dead. The member leaves the list before the
    /// count drops, so no reference cycle survives.
    pub(crate) fn leave(&self, member: &Arc<PolicyState>) -> usize {
        let mut members = self.members.lock().unwrap();
        members.domains.retain(|m| !Arc::ptr_eq(m, member));
        members.usage -= 1;
        members.usage
    }

    pub fn usage_count(&self) -> usize {
        self.members.lock().unwrap().usage
    }

    pub fn min_sampling_rate_us(&self) -> u64 {
        self.min_sampling_rate_us
    }

    pub fn sampling_rate_us(&self) -> Result<u64> {
        let members = self.members.lock().unwrap();
        if members.usage == 0 {
            return Err(GovError::Busy);
        }
        Ok(self.sampling_rate_us.load(Ordering::Relaxed))
    }

    /// Update the sampling rate, clamped to the latency-derived floor.
    ///
    /// Every member domain's delay is recomputed right away under its timer
    /// lock: a shrinking rate must not sit out the remainder of a long
    /// window that was armed under the old one. Returns the clamped value.
    pub fn set_sampling_rate_us(&self, requested_us: u64) -> Result<u64> {
        if requested_us == 0 {
            return Err(GovError::InvalidTunable(
                "sampling rate must be nonzero".into(),
            ));
        }

        let members = self.members.lock().unwrap();
        if members.usage == 0 {
            return Err(GovError::Busy);
        }

        let rate = requested_us.max(self.min_sampling_rate_us);
        self.sampling_rate_us.store(rate, Ordering::Relaxed);

        for policy in &members.domains {
            let _timer = policy.timer_lock();
            policy.set_base_delay(rate);
        }

        Ok(rate)
    }

    pub fn ignore_nice(&self) -> Result<bool> {
        let members = self.members.lock().unwrap();
        if members.usage == 0 {
            return Err(GovError::Busy);
        }
        Ok(self.ignore_nice.load(Ordering::Relaxed))
    }

    /// Flip nice-time accounting. Every member CPU is re-baselined so the
    /// next window's deltas start from counters read under the new
    /// accounting rather than mixing the two.
    pub fn set_ignore_nice(&self, on: bool, times: &dyn CpuTimesSource) -> Result<()> {
        let members = self.members.lock().unwrap();
        if members.usage == 0 {
            return Err(GovError::Busy);
        }

        self.ignore_nice.store(on, Ordering::Relaxed);
        let io_busy = self.io_is_busy.load(Ordering::Relaxed);
        for policy in &members.domains {
            policy.reseed_baselines(times, io_busy);
        }
        Ok(())
    }

    pub fn io_is_busy(&self) -> Result<bool> {
        let members = self.members.lock().unwrap();
        if members.usage == 0 {
            return Err(GovError::Busy);
        }
        Ok(self.io_is_busy.load(Ordering::Relaxed))
    }

    /// Flip iowait accounting, forwarded to the per-CPU time source from
    /// then on. Baselines are refreshed for the same reason as
    /// `set_ignore_nice`.
    pub fn set_io_is_busy(&self, on: bool, times: &dyn CpuTimesSource) -> Result<()> {
        let members = self.members.lock().unwrap();
        if members.usage == 0 {
            return Err(GovError::Busy);
        }

        self.io_is_busy.store(on, Ordering::Relaxed);
        for policy in &members.domains {
            policy.reseed_baselines(times, on);
        }
        Ok(())
    }

    pub(crate) fn raw_sampling_rate_us(&self) -> u64 {
        self.sampling_rate_us.load(Ordering::Relaxed)
    }

    pub(crate) fn raw_ignore_nice(&self) -> bool {
        self.ignore_nice.load(Ordering::Relaxed)
    }

    pub(crate) fn raw_io_is_busy(&self) -> bool {
        self.io_is_busy.load(Ordering::Relaxed)
    }
}
