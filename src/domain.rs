// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

pub type DomainId = usize;

/// Tie-break used when a requested target frequency falls between two
/// supported operating points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// Pick the highest supported frequency not exceeding the target.
    AtMostH,
    /// Pick the lowest supported frequency not lower than the target.
    AtLeastL,
}

/// A set of CPUs sharing one operating frequency.
///
/// Owned by the runtime; the core only ever holds a shared reference.
/// Current frequency and limits are interior-mutable because the runtime
/// updates them around limit changes and frequency transitions while the
/// sampling loop is live.
pub struct Domain {
    id: DomainId,
    cpus: Vec<usize>,
    cur_khz: AtomicU32,
    min_khz: AtomicU32,
    max_khz: AtomicU32,
    transition_latency_ns: u64,
}

impl Domain {
    pub fn new(
        id: DomainId,
        cpus: Vec<usize>,
        cur_khz: u32,
        min_khz: u32,
        max_khz: u32,
        transition_latency_ns: u64,
    ) -> Self {
        Self {
            id,
            cpus,
            cur_khz: AtomicU32::new(cur_khz),
            min_khz: AtomicU32::new(min_khz),
            max_khz: AtomicU32::new(max_khz),
            transition_latency_ns,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn cur_khz(&self) -> u32 {
        self.cur_khz.load(Ordering::Relaxed)
    }

    pub fn min_khz(&self) -> u32 {
        self.min_khz.load(Ordering::Relaxed)
    }

    pub fn max_khz(&self) -> u32 {
        self.max_khz.load(Ordering::Relaxed)
    }

    pub fn transition_latency_ns(&self) -> u64 {
        self.transition_latency_ns
    }

    pub fn set_cur_khz(&self, khz: u32) {
        self.cur_khz.store(khz, Ordering::Relaxed);
    }

    /// Update the frequency limits. Callers should follow up with
    /// `GovernorController::on_limits_changed` so the running frequency is
    /// clamped into the new range.
    pub fn set_limits(&self, min_khz: u32, max_khz: u32) {
        self.min_khz.store(min_khz, Ordering::Relaxed);
        self.max_khz.store(max_khz, Ordering::Relaxed);
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("cpus", &self.cpus)
            .field("cur_khz", &self.cur_khz())
            .field("min_khz", &self.min_khz())
            .field("max_khz", &self.max_khz())
            .finish()
    }
}

/// Frequency-change primitive supplied by the runtime.
///
/// Returns the frequency actually programmed. The core never propagates
/// failures from this seam; they are logged and the next sample retries.
pub trait FreqAdjuster: Send + Sync {
    fn try_target(&self, domain: &Domain, target_khz: u32, relation: Relation) -> Result<u32>;
}
