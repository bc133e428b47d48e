// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};

use crate::hooks::UtilHandler;
use crate::policy::PolicyState;

pub(crate) enum WorkerMsg {
    Sample,
    Exit,
}

/// Stage-2 half of the dispatch handoff: a dedicated thread per started
/// domain, fed sample tokens over a bounded channel. Lives from Start to
/// Stop.
pub(crate) struct PolicyWorker {
    tx: Sender<WorkerMsg>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PolicyWorker {
    /// The channel holds at most one sample token (the admission gate
    /// guarantees one dispatch per window) plus the exit token.
    pub(crate) fn spawn<F>(name: String, body: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = bounded::<WorkerMsg>(2);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let handle = std::thread::Builder::new().name(name).spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    WorkerMsg::Sample => {
                        if !flag.load(Ordering::Acquire) {
                            body();
                        }
                    }
                    WorkerMsg::Exit => break,
                }
            }
        })?;

        Ok(Self {
            tx,
            cancelled,
            handle: Some(handle),
        })
    }

    pub(crate) fn sender(&self) -> Sender<WorkerMsg> {
        self.tx.clone()
    }

    /// Tear the worker down: no decision runs once this returns.
    ///
    /// The cancel flag turns any sample token still queued ahead of the exit
    /// token into a no-op; the join then waits out a decision already in
    /// flight. Callers disarm the per-CPU hooks first, so no new token can
    /// arrive in between.
    pub(crate) fn cancel_and_wait(mut self) {
        self.cancelled.store(true, Ordering::Release);
        let _ = self.tx.send(WorkerMsg::Exit);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PolicyWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancelled.store(true, Ordering::Release);
            let _ = self.tx.send(WorkerMsg::Exit);
            let _ = handle.join();
        }
    }
}

/// Stage-1 half: the per-CPU hook gluing the admission gate to the worker
/// channel. `try_send` on a bounded channel neither blocks nor allocates,
/// which keeps the whole utilization path fit for restricted contexts.
pub(crate) struct CpuGateHook {
    policy: Arc<PolicyState>,
    tx: Sender<WorkerMsg>,
}

impl CpuGateHook {
    pub(crate) fn new(policy: Arc<PolicyState>, tx: Sender<WorkerMsg>) -> Self {
        Self { policy, tx }
    }
}

impl UtilHandler for CpuGateHook {
    fn util_update(&self, now_us: u64) {
        if self.policy.admit(now_us) {
            let _ = self.tx.try_send(WorkerMsg::Sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_sample_token_runs_body() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let worker = PolicyWorker::spawn("fgov-test".into(), move || {
            counter.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();

        worker.sender().send(WorkerMsg::Sample).unwrap();
        wait_for(|| ran.load(Ordering::Acquire) == 1);

        worker.cancel_and_wait();
        assert_eq!(ran.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_cancel_skips_queued_samples() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = bounded::<()>(0);

        let counter = ran.clone();
        let worker = PolicyWorker::spawn("fgov-test".into(), move || {
            counter.fetch_add(1, Ordering::AcqRel);
            release_rx.recv().unwrap();
        })
        .unwrap();

        // First token parks the worker in the body; second stays queued.
        worker.sender().send(WorkerMsg::Sample).unwrap();
        wait_for(|| ran.load(Ordering::Acquire) == 1);
        worker.sender().send(WorkerMsg::Sample).unwrap();

        let cancelled = worker.cancelled.clone();
        let canceller = std::thread::spawn(move || worker.cancel_and_wait());
        wait_for(|| cancelled.load(Ordering::Acquire));
        // Unblock the in-flight body; the queued token must then be
        // swallowed by the cancel flag.
        release_tx.send(()).unwrap();
        canceller.join().unwrap();

        assert_eq!(ran.load(Ordering::Acquire), 1);
    }
}
