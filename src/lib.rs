// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency governor core
//!
//! Shared control-loop machinery for CPU frequency-scaling governors.
//! Concrete governors differ in how they pick a frequency from an observed
//! load; everything around that decision is common and lives here:
//!
//! - per-domain sampling state and the cross-CPU admission gate that lets
//!   exactly one CPU per sampling window trigger a recomputation,
//! - the two-stage handoff from the restricted utilization-event context to
//!   a worker that may block and take locks,
//! - load aggregation over a domain's CPUs from cumulative idle/wall/nice
//!   counters,
//! - the reference-counted tunable set optionally shared by several
//!   domains, and
//! - the attach/start/stop/limits/detach lifecycle with a hard shutdown
//!   barrier.
//!
//! The runtime supplies the per-CPU time source, the frequency-change
//! primitive and the stream of utilization events; a governor variant
//! supplies the decision function. Both plug in as traits:
//!
//!```no_run
//!     use std::sync::Arc;
//!     use freqgov::{Domain, GovernorController};
//!     # let my_variant: Arc<dyn freqgov::GovernorPolicy> = unimplemented!();
//!     # let my_times: Arc<dyn freqgov::CpuTimesSource> = unimplemented!();
//!     # let my_freq: Arc<dyn freqgov::FreqAdjuster> = unimplemented!();
//!
//!     let ctl = GovernorController::new(my_variant, my_times, my_freq, 8, false);
//!     let dom = Arc::new(Domain::new(0, vec![0, 1, 2, 3], 1_200_000, 800_000, 2_400_000, 50_000));
//!     ctl.attach(&dom).unwrap();
//!     ctl.start(dom.id()).unwrap();
//!     // scheduler-event path, per CPU:
//!     ctl.hooks().util_update(2, 1_000_000);
//!```

mod domain;
pub use domain::Domain;
pub use domain::DomainId;
pub use domain::FreqAdjuster;
pub use domain::Relation;

mod error;
pub use error::GovError;
pub use error::Result;

mod sample;
pub use sample::CpuSample;
pub use sample::CpuTimes;
pub use sample::CpuTimesSource;
pub use sample::SampleTable;

mod load;

mod tunables;
pub use tunables::TunableSet;
pub use tunables::LATENCY_MULTIPLIER;
pub use tunables::MIN_LATENCY_MULTIPLIER;

mod policy;
pub use policy::PolicyState;

mod hooks;
pub use hooks::UtilHandler;
pub use hooks::UtilHooks;

mod worker;

mod governor;
pub use governor::GovernorController;
pub use governor::GovernorPolicy;
pub use governor::SampleContext;
