// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::domain::{Domain, DomainId, FreqAdjuster, Relation};
use crate::error::{GovError, Result};
use crate::hooks::UtilHooks;
use crate::load::aggregate_load;
use crate::policy::PolicyState;
use crate::sample::{CpuTimesSource, SampleTable};
use crate::tunables::TunableSet;
use crate::worker::{CpuGateHook, PolicyWorker};

/// What a governor variant's decision function gets to see and touch while
/// a sample is being evaluated. Held under the domain's timer lock.
pub struct SampleContext<'a> {
    policy: &'a PolicyState,
    freq: &'a dyn FreqAdjuster,
}

impl<'a> SampleContext<'a> {
    pub fn domain(&self) -> &Domain {
        &**self.policy.domain()
    }

    pub fn policy(&self) -> &PolicyState {
        self.policy
    }

    /// Ask the runtime for a frequency change. Failures are logged and
    /// swallowed: stalling the sampling loop over one missed transition
    /// would be worse than running a stale frequency for a window.
    pub fn apply_freq(&self, target_khz: u32, relation: Relation) {
        match self.freq.try_target(self.domain(), target_khz, relation) {
            Ok(khz) => self.policy.domain().set_cur_khz(khz),
            Err(e) => warn!(
                "domain {}: frequency change to {} kHz failed: {:#}",
                self.domain().id(),
                target_khz,
                e
            ),
        }
    }
}

/// One implementation per governor variant, selected when the controller is
/// built.
///
/// `tick` is the decision function: it consumes the aggregate load, may
/// reprogram the frequency through the context, may widen or narrow the
/// window via the policy's rate multiplier, and returns the next base
/// sample delay in microseconds.
pub trait GovernorPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs once for every tunable set this variant brings up. Failure
    /// aborts the attach that created the set.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Counterpart of `init`, runs when a tunable set loses its last user.
    fn exit(&self) {}

    /// Variant-imposed lower bound for the sampling rate, folded into the
    /// latency-derived floor at attach.
    fn rate_floor_us(&self) -> u64 {
        0
    }

    fn start(&self, _domain: &Domain) {}

    fn stop(&self, _domain: &Domain) {}

    fn tick(&self, ctx: &SampleContext<'_>, load: u32) -> u64;
}

/// Stage-2 body: everything one decision needs, captured at Start.
struct SampleRunner {
    policy: Arc<PolicyState>,
    governor: Arc<dyn GovernorPolicy>,
    times: Arc<dyn CpuTimesSource>,
    freq: Arc<dyn FreqAdjuster>,
}

impl SampleRunner {
    /// Evaluate one sampling window and publish the next delay.
    ///
    /// The timer lock excludes concurrent tunable writers and limit
    /// changes. The window is reopened only after the new delay is
    /// published (release fence inside `finish_sample`), so the next
    /// admitted CPU never reads stale timing.
    fn run_once(&self) {
        let policy = &*self.policy;
        let tunables = policy.tunables();
        {
            let _timer = policy.timer_lock();
            let effective_rate = tunables.raw_sampling_rate_us() * policy.rate_mult() as u64;
            let load = aggregate_load(
                policy.domain().cpus(),
                policy.table(),
                &*self.times,
                effective_rate,
                tunables.raw_ignore_nice(),
                tunables.raw_io_is_busy(),
            );

            let ctx = SampleContext {
                policy,
                freq: &*self.freq,
            };
            let delay_us = self.governor.tick(&ctx, load);
            policy.set_base_delay(delay_us);
            debug!(
                "{}: domain {} load {} next delay {}us",
                self.governor.name(),
                policy.domain().id(),
                load,
                delay_us
            );
        }
        policy.finish_sample();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Attached,
    Started,
    Stopped,
}

struct DomainSlot {
    policy: Arc<PolicyState>,
    worker: Option<PolicyWorker>,
    state: Lifecycle,
}

struct Inner {
    /// The governor-wide tunable set when tunables are not per-domain.
    shared_tunables: Option<Arc<TunableSet>>,
    domains: HashMap<DomainId, DomainSlot>,
}

/// Lifecycle state machine driving one governor variant over any number of
/// frequency domains.
///
/// Per domain: Attach allocates control state and joins or creates the
/// tunable set; Start arms the per-CPU gates and the worker; Stop is a hard
/// barrier leaving no sampling activity behind; Detach tears the control
/// state down and drops the tunable-set reference. LimitsChanged and CPU
/// online/offline are serviced in place.
pub struct GovernorController {
    governor: Arc<dyn GovernorPolicy>,
    times: Arc<dyn CpuTimesSource>,
    freq: Arc<dyn FreqAdjuster>,
    hooks: Arc<UtilHooks>,
    table: Arc<SampleTable>,
    per_domain_tunables: bool,
    inner: Mutex<Inner>,
}

impl GovernorController {
    pub fn new(
        governor: Arc<dyn GovernorPolicy>,
        times: Arc<dyn CpuTimesSource>,
        freq: Arc<dyn FreqAdjuster>,
        nr_cpu_ids: usize,
        per_domain_tunables: bool,
    ) -> Self {
        Self {
            governor,
            times,
            freq,
            hooks: Arc::new(UtilHooks::new(nr_cpu_ids)),
            table: Arc::new(SampleTable::new(nr_cpu_ids)),
            per_domain_tunables,
            inner: Mutex::new(Inner {
                shared_tunables: None,
                domains: HashMap::new(),
            }),
        }
    }

    /// The hook registry the runtime feeds utilization events into.
    pub fn hooks(&self) -> &Arc<UtilHooks> {
        &self.hooks
    }

    pub fn table(&self) -> &Arc<SampleTable> {
        &self.table
    }

    /// Bring a domain under governance. The domain keeps its current
    /// frequency until Start arms sampling.
    pub fn attach(&self, domain: &Arc<Domain>) -> Result<()> {
        if domain.cpus().is_empty() {
            return Err(GovError::EmptyDomain(domain.id()));
        }
        for &cpu in domain.cpus() {
            self.table.check_cpu(cpu)?;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.domains.contains_key(&domain.id()) {
            return Err(GovError::AlreadyAttached(domain.id()));
        }

        let (tunables, created) = match (&inner.shared_tunables, self.per_domain_tunables) {
            (Some(shared), false) => (shared.clone(), false),
            _ => (
                Arc::new(TunableSet::from_latency(
                    domain.transition_latency_ns(),
                    self.governor.rate_floor_us(),
                )),
                true,
            ),
        };

        let policy = PolicyState::new(domain.clone(), tunables.clone(), self.table.clone());
        tunables.join(policy.clone());

        if created {
            if let Err(e) = self.governor.init() {
                // Unwind the join; the fresh set dies with this scope.
                tunables.leave(&policy);
                return Err(GovError::Init(e));
            }
            if !self.per_domain_tunables {
                inner.shared_tunables = Some(tunables);
            }
        }

        inner.domains.insert(
            domain.id(),
            DomainSlot {
                policy,
                worker: None,
                state: Lifecycle::Attached,
            },
        );
        debug!("{}: domain {} attached", self.governor.name(), domain.id());
        Ok(())
    }

    /// Remove a stopped (or never-started) domain from governance. The last
    /// domain out of a tunable set destroys it.
    pub fn detach(&self, id: DomainId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.domains.get(&id) {
            None => return Err(GovError::NotAttached(id)),
            Some(slot) if slot.state == Lifecycle::Started => {
                return Err(GovError::Started(id))
            }
            Some(_) => {}
        }

        let Some(slot) = inner.domains.remove(&id) else {
            return Err(GovError::NotAttached(id));
        };
        let tunables = slot.policy.tunables().clone();
        if tunables.leave(&slot.policy) == 0 {
            self.governor.exit();
            let was_shared = inner
                .shared_tunables
                .as_ref()
                .map_or(false, |shared| Arc::ptr_eq(shared, &tunables));
            if was_shared {
                inner.shared_tunables = None;
            }
        }
        debug!("{}: domain {} detached", self.governor.name(), id);
        Ok(())
    }

    /// Arm sampling: baseline every member CPU, spawn the worker and hook
    /// every CPU's utilization events into the admission gate.
    pub fn start(&self, id: DomainId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.domains.get_mut(&id).ok_or(GovError::NotAttached(id))?;
        if slot.state == Lifecycle::Started {
            return Err(GovError::Started(id));
        }

        let policy = slot.policy.clone();
        let domain = policy.domain().clone();
        if domain.cur_khz() == 0 {
            return Err(GovError::NoCurrentFrequency(id));
        }

        let runner = SampleRunner {
            policy: policy.clone(),
            governor: self.governor.clone(),
            times: self.times.clone(),
            freq: self.freq.clone(),
        };
        let worker = PolicyWorker::spawn(format!("fgov-dom{}", id), move || runner.run_once())
            .map_err(GovError::Worker)?;

        let tunables = policy.tunables();
        let io_busy = tunables.raw_io_is_busy();
        for &cpu in domain.cpus() {
            self.table.seed(cpu, self.times.cpu_times(cpu, io_busy));
        }

        policy.set_rate_mult(1);
        policy.set_is_shared(domain.cpus().len() > 1);
        policy.set_base_delay(tunables.raw_sampling_rate_us());
        policy.reset_last_sample_time();
        policy.reset_window();

        self.governor.start(&domain);

        for &cpu in domain.cpus() {
            self.hooks
                .arm(cpu, Arc::new(CpuGateHook::new(policy.clone(), worker.sender())));
        }

        slot.worker = Some(worker);
        slot.state = Lifecycle::Started;
        debug!("{}: domain {} started", self.governor.name(), id);
        Ok(())
    }

    /// Disarm sampling. Hard synchronous barrier: when this returns, no
    /// gate invocation, queued token or decision survives, and the window
    /// counters are reset.
    pub fn stop(&self, id: DomainId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.domains.get_mut(&id).ok_or(GovError::NotAttached(id))?;
        if slot.state != Lifecycle::Started {
            return Err(GovError::NotStarted(id));
        }

        // Disarm first: hook removal waits out in-flight gate calls, so
        // nothing can signal the worker afterwards.
        for &cpu in slot.policy.domain().cpus() {
            self.hooks.disarm(cpu);
        }
        if let Some(worker) = slot.worker.take() {
            worker.cancel_and_wait();
        }
        slot.policy.reset_window();
        self.governor.stop(slot.policy.domain());
        slot.state = Lifecycle::Stopped;
        debug!("{}: domain {} stopped", self.governor.name(), id);
        Ok(())
    }

    /// Clamp the running frequency into the domain's updated limits, then
    /// refresh the sample delay. Applied before returning, not deferred to
    /// the next sample.
    pub fn on_limits_changed(&self, id: DomainId) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.domains.get(&id).ok_or(GovError::NotAttached(id))?;
        let policy = &*slot.policy;

        let _timer = policy.timer_lock();
        let domain = &**policy.domain();
        let ctx = SampleContext {
            policy,
            freq: &*self.freq,
        };
        let cur = domain.cur_khz();
        if domain.max_khz() < cur {
            ctx.apply_freq(domain.max_khz(), Relation::AtMostH);
        } else if domain.min_khz() > cur {
            ctx.apply_freq(domain.min_khz(), Relation::AtLeastL);
        }
        policy.set_base_delay(policy.tunables().raw_sampling_rate_us());
        Ok(())
    }

    /// A CPU of a started domain came online: re-baseline it and arm its
    /// gate. CPUs outside any started domain are ignored.
    pub fn on_cpu_online(&self, cpu: usize) -> Result<()> {
        self.table.check_cpu(cpu)?;
        let inner = self.inner.lock().unwrap();
        for slot in inner.domains.values() {
            if slot.state != Lifecycle::Started || !slot.policy.domain().cpus().contains(&cpu) {
                continue;
            }
            let io_busy = slot.policy.tunables().raw_io_is_busy();
            self.table.seed(cpu, self.times.cpu_times(cpu, io_busy));
            if let Some(worker) = &slot.worker {
                self.hooks
                    .arm(cpu, Arc::new(CpuGateHook::new(slot.policy.clone(), worker.sender())));
            }
            break;
        }
        Ok(())
    }

    /// A CPU of a started domain went offline: disarm its gate and drop its
    /// window state. The remaining CPUs keep governing the domain.
    pub fn on_cpu_offline(&self, cpu: usize) -> Result<()> {
        self.table.check_cpu(cpu)?;
        let inner = self.inner.lock().unwrap();
        for slot in inner.domains.values() {
            if slot.state != Lifecycle::Started || !slot.policy.domain().cpus().contains(&cpu) {
                continue;
            }
            self.hooks.disarm(cpu);
            self.table.clear(cpu);
            break;
        }
        Ok(())
    }

    /// The tunable set governing a domain.
    pub fn tunables(&self, id: DomainId) -> Result<Arc<TunableSet>> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.domains.get(&id).ok_or(GovError::NotAttached(id))?;
        Ok(slot.policy.tunables().clone())
    }

    pub fn sampling_rate_us(&self, id: DomainId) -> Result<u64> {
        self.tunables(id)?.sampling_rate_us()
    }

    pub fn set_sampling_rate_us(&self, id: DomainId, rate_us: u64) -> Result<u64> {
        self.tunables(id)?.set_sampling_rate_us(rate_us)
    }

    pub fn set_ignore_nice(&self, id: DomainId, on: bool) -> Result<()> {
        self.tunables(id)?.set_ignore_nice(on, &*self.times)
    }

    pub fn set_io_is_busy(&self, id: DomainId, on: bool) -> Result<()> {
        self.tunables(id)?.set_io_is_busy(on, &*self.times)
    }
}
