//! Trigger Poller: the control loop.
//!
//! Each cycle, at a fixed cadence:
//!
//! 1. If the link is down, make one connect attempt. On failure the cycle ends
//!    and the loop waits `reconnect_backoff` before the next one.
//! 2. If the identification trigger is set, read identifier and label in one
//!    exclusive section, append an [`IdentificationEvent`], clear the trigger.
//!    A failed read leaves the trigger set so the pulse is retried.
//! 3. Reap tasks that finished on their own budget, then read the
//!    sampling-trigger bitmap and hand it to the [`TaskLifecycleManager`].
//!    Reaping first means a trigger the controller raised again after a
//!    task's self-clear starts a new task in this same cycle. If the bitmap
//!    read fails, reconciliation is skipped, so an unreadable bitmap never
//!    stops running tasks.
//!
//! Shutdown (on the watch channel) stops accepting new tasks, cancels and
//! joins all running ones, then releases the link and closes the sink.

use crate::address::{AddressLayout, TriggerState};
use crate::config::TimingSettings;
use crate::error::{AppResult, DaqError};
use crate::guardian::LinkGuardian;
use crate::lifecycle::{ReconcileReport, TaskLifecycleManager};
use crate::link::{AddressableLink, LinkError};
use crate::sink::{EventSink, IdentificationEvent};
use crate::stats::{AcquisitionStats, StatsSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The link was down and could not be re-established.
    Disconnected,
    /// The sampling-trigger bitmap could not be read; tasks were left alone.
    BitmapUnavailable,
    /// The bitmap was read and the registry reconciled against it.
    Reconciled(ReconcileReport),
}

/// Summary returned by [`TriggerPoller::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Poll cycles executed.
    pub cycles: u64,
    /// Tasks that were still running at shutdown.
    pub tasks_stopped: usize,
    /// Final counters.
    pub stats: StatsSnapshot,
}

/// The single control loop.
pub struct TriggerPoller<L> {
    layout: Arc<AddressLayout>,
    poll_interval: Duration,
    reconnect_backoff: Duration,
    guardian: LinkGuardian<L>,
    sink: Arc<dyn EventSink>,
    stats: Arc<AcquisitionStats>,
    manager: TaskLifecycleManager<L>,
}

impl<L> TriggerPoller<L>
where
    L: AddressableLink + 'static,
{
    /// Wire a poller over `guardian` and `sink`.
    pub fn new(
        layout: AddressLayout,
        timing: TimingSettings,
        guardian: LinkGuardian<L>,
        sink: Arc<dyn EventSink>,
        stats: Arc<AcquisitionStats>,
    ) -> Self {
        let layout = Arc::new(layout);
        let manager = TaskLifecycleManager::new(
            Arc::clone(&layout),
            timing.sampling(),
            guardian.clone(),
            Arc::clone(&sink),
            Arc::clone(&stats),
        );
        Self {
            layout,
            poll_interval: timing.poll_interval,
            reconnect_backoff: timing.reconnect_backoff,
            guardian,
            sink,
            stats,
            manager,
        }
    }

    /// The lifecycle manager, for inspecting the registry.
    pub fn manager(&self) -> &TaskLifecycleManager<L> {
        &self.manager
    }

    /// Run one cycle.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        if !self.guardian.is_connected().await {
            if let Err(err) = self.guardian.ensure_connected().await {
                warn!(error = %err, "Controller unreachable, acquisition paused");
                return CycleOutcome::Disconnected;
            }
            info!("Controller link established");
        }

        match self.identify().await {
            Ok(()) => {}
            Err(err @ DaqError::SinkWrite(_)) => {
                self.stats.record_identification_failure();
                error!(error = %err, "Identification event dropped");
            }
            Err(err) => {
                warn!(error = %err, "Identification fields unreadable, retrying next cycle");
            }
        }

        let mut reaped = self.manager.reap_finished().await;

        let layout = &self.layout;
        match self
            .guardian
            .read_bitmap(
                layout.region,
                layout.sampling_bitmap_offset,
                layout.sampling_bitmap_length,
            )
            .await
        {
            Ok(bits) => {
                let triggers = TriggerState::from_bitmap(bits, layout.slot_count);
                let mut report = self.manager.reconcile(&triggers).await;
                reaped.append(&mut report.reaped);
                report.reaped = reaped;
                CycleOutcome::Reconciled(report)
            }
            Err(err) => {
                warn!(error = %err, "Sampling triggers unreadable, skipping reconciliation");
                CycleOutcome::BitmapUnavailable
            }
        }
    }

    /// Record a box identification if its trigger is raised.
    ///
    /// A trigger that is clear or unreadable is not an error. Once the fields
    /// are read the trigger is cleared even if the sink rejects the event.
    async fn identify(&self) -> AppResult<()> {
        let layout = &self.layout;
        let region = layout.region;
        let trigger = layout.identification_trigger;

        match self.guardian.read_bit(region, trigger).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => {
                debug!(error = %err, "Identification trigger unreadable");
                return Ok(());
            }
        }

        let (identifier_offset, label_offset, label_length) =
            (layout.identifier_offset, layout.label_offset, layout.label_length);
        let (identifier, label) = self
            .guardian
            .with_link(move |link| {
                Box::pin(async move {
                    let identifier = link.read_word16(region, identifier_offset).await?;
                    let label = link.read_text(region, label_offset, label_length).await?;
                    Ok::<_, LinkError>((identifier, label))
                })
            })
            .await?;

        let slot = layout.slot_from_number(i64::from(identifier));
        let event = IdentificationEvent::new(slot, identifier, label);
        let appended = self.sink.append_identification_event(&event).await;

        if let Err(err) = self.guardian.write_bit(region, trigger, false).await {
            warn!(error = %err, "Could not clear identification trigger");
        }

        appended?;
        self.stats.record_identification();
        info!(identifier, label = %event.label, "Box identified");
        Ok(())
    }

    /// Poll until `shutdown` turns `true` (or its sender is dropped), then
    /// shut down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ShutdownReport {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        info!(
            poll_interval = ?self.poll_interval,
            slots = self.layout.slot_count,
            "Trigger poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            cycles += 1;
            if self.poll_once().await == CycleOutcome::Disconnected {
                tokio::select! {
                    _ = tokio::time::sleep(self.reconnect_backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown(cycles).await
    }

    async fn shutdown(mut self, cycles: u64) -> ShutdownReport {
        info!(active = self.manager.len(), "Shutting down acquisition");
        let summaries = self.manager.shutdown_all().await;
        self.guardian.disconnect().await;
        if let Err(err) = self.sink.close().await {
            error!(error = %err, "Failed to close event sink");
        }

        let stats = self.stats.snapshot();
        info!(cycles, %stats, "Acquisition stopped");
        ShutdownReport {
            cycles,
            tasks_stopped: summaries.len(),
            stats,
        }
    }
}
