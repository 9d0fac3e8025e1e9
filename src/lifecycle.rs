//! Task Lifecycle Manager.
//!
//! Reconciles the sampling-trigger bitmap against the registry of running
//! [`SamplingTask`]s. The registry is owned by the manager and the manager is
//! only driven from the poller loop, so it needs no locking of its own.
//!
//! Per cycle, the poller first calls [`TaskLifecycleManager::reap_finished`]
//! and only then reads the bitmap. A task that exited on its own has already
//! cleared its trigger bit, so the bitmap read afterwards reflects that clear
//! and a bit set again by the controller starts a fresh task in that cycle.
//!
//! [`TaskLifecycleManager::reconcile`] then handles every slot: bit set and
//! idle starts a task; bit clear and active stops it. All stops of one cycle
//! are requested before any of them is joined, so the wait is bounded by one
//! iteration however many triggers cleared at once.
//!
//! Joining and clearing a trigger bit are both idempotent, so a task that
//! finishes on its own at the same moment the manager stops it resolves to
//! the same end state.

use crate::address::{AddressLayout, Slot, TriggerState};
use crate::guardian::LinkGuardian;
use crate::link::AddressableLink;
use crate::sampling::{
    ExitReason, SamplingHandle, SamplingParams, SamplingSummary, SamplingTask, SamplingTiming,
};
use crate::sink::EventSink;
use crate::stats::AcquisitionStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Slots whose task was started.
    pub started: Vec<Slot>,
    /// Slots whose task was stopped because the trigger cleared.
    pub stopped: Vec<Slot>,
    /// Slots whose task had already finished on its own budget.
    pub reaped: Vec<Slot>,
}

impl ReconcileReport {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.reaped.is_empty()
    }
}

/// Owner of the Active Task Registry.
pub struct TaskLifecycleManager<L> {
    layout: Arc<AddressLayout>,
    timing: SamplingTiming,
    guardian: LinkGuardian<L>,
    sink: Arc<dyn EventSink>,
    stats: Arc<AcquisitionStats>,
    registry: BTreeMap<Slot, SamplingHandle>,
    accepting: bool,
}

impl<L> TaskLifecycleManager<L>
where
    L: AddressableLink + 'static,
{
    /// Create a manager with an empty registry.
    pub fn new(
        layout: Arc<AddressLayout>,
        timing: SamplingTiming,
        guardian: LinkGuardian<L>,
        sink: Arc<dyn EventSink>,
        stats: Arc<AcquisitionStats>,
    ) -> Self {
        Self {
            layout,
            timing,
            guardian,
            sink,
            stats,
            registry: BTreeMap::new(),
            accepting: true,
        }
    }

    /// Slots with a registered task, ascending.
    pub fn active_slots(&self) -> Vec<Slot> {
        self.registry.keys().copied().collect()
    }

    /// Whether `slot` has a registered task.
    pub fn is_active(&self, slot: Slot) -> bool {
        self.registry.contains_key(&slot)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no task is registered.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Bring the registry in line with `triggers`.
    ///
    /// Call [`TaskLifecycleManager::reap_finished`] before reading the bitmap
    /// that produced `triggers`.
    pub async fn reconcile(&mut self, triggers: &TriggerState) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for (slot, set) in triggers.iter() {
            let active = self.registry.contains_key(&slot);
            if set && !active && self.accepting {
                self.start(slot);
                report.started.push(slot);
            } else if !set {
                if let Some(handle) = self.registry.get_mut(&slot) {
                    if handle.is_finished() {
                        report.reaped.push(slot);
                    } else {
                        handle.request_stop();
                        report.stopped.push(slot);
                    }
                }
            }
        }

        for slot in report.stopped.clone() {
            self.join_and_settle(slot).await;
            info!(slot = %slot, "Sampling trigger cleared, task stopped");
        }
        for slot in report.reaped.clone() {
            self.join_and_settle(slot).await;
            debug!(slot = %slot, "Reaped finished sampling task");
        }

        if !report.is_empty() {
            debug!(
                started = ?report.started,
                stopped = ?report.stopped,
                reaped = ?report.reaped,
                active = self.registry.len(),
                "Reconciled sampling tasks"
            );
        }
        report
    }

    fn start(&mut self, slot: Slot) {
        let params = SamplingParams::for_slot(&self.layout, slot, self.timing);
        let handle = SamplingTask::spawn(
            params,
            self.guardian.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
        );
        self.registry.insert(slot, handle);
        self.stats.record_task_started();
        info!(slot = %slot, "Sampling trigger set, task started");
    }

    /// Stop the task for `slot`, waiting for it to exit. `None` if idle.
    pub async fn stop(&mut self, slot: Slot) -> Option<SamplingSummary> {
        let handle = self.registry.remove(&slot)?;
        let summary = handle.stop().await;
        self.settle(slot, summary.as_ref()).await;
        info!(slot = %slot, "Sampling trigger cleared, task stopped");
        summary
    }

    /// Stop accepting starts, cancel every task, then wait for all of them.
    pub async fn shutdown_all(&mut self) -> Vec<SamplingSummary> {
        self.accepting = false;
        for handle in self.registry.values_mut() {
            handle.request_stop();
        }

        let mut summaries = Vec::with_capacity(self.registry.len());
        while let Some((slot, handle)) = self.registry.pop_first() {
            let summary = handle.join().await;
            self.settle(slot, summary.as_ref()).await;
            summaries.extend(summary);
        }
        summaries
    }

    /// Join and remove tasks that exited on their own budget.
    pub async fn reap_finished(&mut self) -> Vec<Slot> {
        let finished: Vec<Slot> = self
            .registry
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(slot, _)| *slot)
            .collect();

        for slot in &finished {
            self.join_and_settle(*slot).await;
            debug!(slot = %slot, "Reaped finished sampling task");
        }
        finished
    }

    async fn join_and_settle(&mut self, slot: Slot) {
        if let Some(handle) = self.registry.remove(&slot) {
            let summary = handle.join().await;
            self.settle(slot, summary.as_ref()).await;
        }
    }

    /// Count the exit and make sure the trigger bit ends up clear.
    async fn settle(&self, slot: Slot, summary: Option<&SamplingSummary>) {
        match summary.map(|s| s.exit) {
            Some(ExitReason::BudgetElapsed) => self.stats.record_task_completed(),
            Some(ExitReason::Stopped) | None => self.stats.record_task_stopped(),
        }

        if summary.is_some_and(|s| s.trigger_cleared) {
            return;
        }
        let trigger = self.layout.sampling_trigger(slot);
        if let Err(err) = self.guardian.write_bit(self.layout.region, trigger, false).await {
            self.stats.record_trigger_clear_failure();
            warn!(slot = %slot, error = %err, "Could not clear sampling trigger");
        }
    }
}
