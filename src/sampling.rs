//! Sampling Task: one bounded acquisition job per active slot.
//!
//! A task reads the slot's four-float measurement block at a fixed interval
//! and appends a [`SampleRecord`] per successful read, until its time budget
//! runs out or it is asked to stop. Either way it clears the slot's
//! sampling-trigger bit on the controller exactly once before exiting.
//!
//! Stop requests are observed only while the task waits for the next
//! iteration, never in the middle of a link read or sink write.

use crate::address::{AddressLayout, BitAddress, Slot};
use crate::guardian::LinkGuardian;
use crate::link::AddressableLink;
use crate::sink::{EventSink, SampleRecord};
use crate::stats::AcquisitionStats;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Interval and budget shared by every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingTiming {
    /// Pause between two reads.
    pub interval: Duration,
    /// Total time budget of one task.
    pub duration: Duration,
}

/// Everything a task needs to know about its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingParams {
    /// Slot being sampled.
    pub slot: Slot,
    /// Data block holding the slot's fields.
    pub region: u16,
    /// Byte offset of the slot's measurement block.
    pub data_offset: u32,
    /// The slot's sampling-trigger bit.
    pub trigger: BitAddress,
    /// Interval and budget.
    pub timing: SamplingTiming,
}

impl SamplingParams {
    /// Derive the slot's addresses from the layout.
    pub fn for_slot(layout: &AddressLayout, slot: Slot, timing: SamplingTiming) -> Self {
        Self {
            slot,
            region: layout.region,
            data_offset: layout.data_offset(slot),
            trigger: layout.sampling_trigger(slot),
            timing,
        }
    }
}

/// Why a task left its sampling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// The time budget ran out.
    BudgetElapsed,
    /// A stop was requested.
    Stopped,
}

/// Result of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplingSummary {
    /// Slot that was sampled.
    pub slot: Slot,
    /// Records accepted by the sink.
    pub samples_written: u64,
    /// Reads that failed and were skipped.
    pub read_failures: u64,
    /// Records the sink rejected.
    pub sink_failures: u64,
    /// How the loop ended.
    pub exit: ExitReason,
    /// Whether the trigger-bit clear reached the controller.
    pub trigger_cleared: bool,
}

/// Handle to a running task, held by the lifecycle manager.
#[derive(Debug)]
pub struct SamplingHandle {
    slot: Slot,
    cancel: Option<oneshot::Sender<()>>,
    join: JoinHandle<SamplingSummary>,
}

impl SamplingHandle {
    /// Slot the task samples.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the task to stop at its next iteration boundary. Idempotent.
    pub fn request_stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The receiver is gone once the task finished on its own.
            let _ = cancel.send(());
        }
    }

    /// Wait for the task to exit. `None` if it panicked.
    pub async fn join(self) -> Option<SamplingSummary> {
        match self.join.await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(slot = %self.slot, error = %err, "Sampling task died");
                None
            }
        }
    }

    /// Request a stop and wait for the task to exit.
    pub async fn stop(mut self) -> Option<SamplingSummary> {
        self.request_stop();
        self.join().await
    }
}

/// Spawns sampling tasks.
pub struct SamplingTask;

impl SamplingTask {
    /// Start sampling `params.slot` on the current runtime.
    pub fn spawn<L>(
        params: SamplingParams,
        guardian: LinkGuardian<L>,
        sink: Arc<dyn EventSink>,
        stats: Arc<AcquisitionStats>,
    ) -> SamplingHandle
    where
        L: AddressableLink + 'static,
    {
        let slot = params.slot;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let span = info_span!("sampling", slot = %slot);
        let join = tokio::spawn(
            sampling_loop(params, guardian, sink, stats, cancel_rx).instrument(span),
        );
        SamplingHandle {
            slot,
            cancel: Some(cancel_tx),
            join,
        }
    }
}

async fn sampling_loop<L>(
    params: SamplingParams,
    guardian: LinkGuardian<L>,
    sink: Arc<dyn EventSink>,
    stats: Arc<AcquisitionStats>,
    mut cancel: oneshot::Receiver<()>,
) -> SamplingSummary
where
    L: AddressableLink + 'static,
{
    let started = Instant::now();
    let mut summary = SamplingSummary {
        slot: params.slot,
        samples_written: 0,
        read_failures: 0,
        sink_failures: 0,
        exit: ExitReason::BudgetElapsed,
        trigger_cleared: false,
    };
    info!(
        offset = params.data_offset,
        interval = ?params.timing.interval,
        duration = ?params.timing.duration,
        "Sampling started"
    );

    while started.elapsed() < params.timing.duration {
        match guardian
            .read_floats4(params.region, params.data_offset)
            .await
        {
            Ok(values) => {
                let record = SampleRecord::new(params.slot, values);
                match sink.append_sample_record(&record).await {
                    Ok(()) => {
                        summary.samples_written += 1;
                        stats.record_sample();
                    }
                    Err(err) => {
                        summary.sink_failures += 1;
                        stats.record_sink_failure();
                        warn!(error = %err, "Sample dropped, sink write failed");
                    }
                }
            }
            Err(err) => {
                summary.read_failures += 1;
                stats.record_sample_read_failure();
                debug!(error = %err, "Sample read failed, skipping");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(params.timing.interval) => {}
            _ = &mut cancel => {
                summary.exit = ExitReason::Stopped;
                break;
            }
        }
    }

    match guardian.write_bit(params.region, params.trigger, false).await {
        Ok(()) => summary.trigger_cleared = true,
        Err(err) => {
            stats.record_trigger_clear_failure();
            warn!(error = %err, "Could not clear sampling trigger");
        }
    }

    info!(
        samples = summary.samples_written,
        read_failures = summary.read_failures,
        exit = ?summary.exit,
        "Sampling finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockPlc;
    use crate::sink::MemorySink;

    const INTERVAL: Duration = Duration::from_millis(100);

    struct Rig {
        plc: MockPlc,
        sink: MemorySink,
        guardian: LinkGuardian<MockPlc>,
        stats: Arc<AcquisitionStats>,
        layout: AddressLayout,
    }

    async fn rig() -> Rig {
        let plc = MockPlc::with_region(1);
        let stats = Arc::new(AcquisitionStats::new());
        let guardian = LinkGuardian::new(plc.clone(), Arc::clone(&stats));
        guardian.ensure_connected().await.unwrap();
        Rig {
            plc,
            sink: MemorySink::new(),
            guardian,
            stats,
            layout: AddressLayout::default(),
        }
    }

    impl Rig {
        fn spawn(&self, slot: u16, intervals: u32) -> SamplingHandle {
            let slot = Slot::new(slot).unwrap();
            let timing = SamplingTiming {
                interval: INTERVAL,
                duration: INTERVAL * intervals,
            };
            self.plc
                .set_bit(1, self.layout.sampling_trigger(slot), true);
            SamplingTask::spawn(
                SamplingParams::for_slot(&self.layout, slot, timing),
                self.guardian.clone(),
                Arc::new(self.sink.clone()),
                Arc::clone(&self.stats),
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_out_its_budget_and_clears_trigger() {
        let rig = rig().await;
        let slot = Slot::new(2).unwrap();
        rig.plc
            .set_floats4(1, rig.layout.data_offset(slot), [1.0, 230.0, 20.0, 21.0]);

        let summary = rig.spawn(2, 4).join().await.unwrap();

        assert_eq!(summary.exit, ExitReason::BudgetElapsed);
        assert_eq!(summary.samples_written, 4);
        assert!(summary.trigger_cleared);
        assert_eq!(rig.sink.samples_for(slot).len(), 4);
        assert_eq!(rig.sink.samples_for(slot)[0].voltage(), 230.0);

        let trigger = rig.layout.sampling_trigger(slot);
        assert!(!rig.plc.bit(1, trigger));
        assert_eq!(rig.plc.bit_writes_at(1, trigger), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_honoured_at_iteration_boundary() {
        let rig = rig().await;
        let handle = rig.spawn(3, 10);

        tokio::time::sleep(INTERVAL * 5 / 2).await;
        let summary = handle.stop().await.unwrap();

        assert_eq!(summary.exit, ExitReason::Stopped);
        assert_eq!(summary.samples_written, 3);
        let trigger = rig.layout.sampling_trigger(Slot::new(3).unwrap());
        assert_eq!(rig.plc.bit_writes_at(1, trigger), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failures_are_skipped() {
        let rig = rig().await;
        let slot = Slot::new(1).unwrap();
        rig.plc.fail_next_reads_at(1, rig.layout.data_offset(slot), 2);

        let summary = rig.spawn(1, 5).join().await.unwrap();

        assert_eq!(summary.read_failures, 2);
        assert_eq!(summary.samples_written, 3);
        assert_eq!(rig.stats.snapshot().sample_read_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failures_are_counted_not_fatal() {
        let rig = rig().await;
        rig.sink.fail_next_samples(1);

        let summary = rig.spawn(4, 3).join().await.unwrap();

        assert_eq!(summary.sink_failures, 1);
        assert_eq!(summary.samples_written, 2);
        assert_eq!(rig.stats.snapshot().sink_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_a_finished_task_is_harmless() {
        let rig = rig().await;
        let mut handle = rig.spawn(5, 1);
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(handle.is_finished());
        handle.request_stop();
        handle.request_stop();
        let summary = handle.join().await.unwrap();
        assert_eq!(summary.exit, ExitReason::BudgetElapsed);
        let trigger = rig.layout.sampling_trigger(Slot::new(5).unwrap());
        assert_eq!(rig.plc.bit_writes_at(1, trigger).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_failure_is_reported() {
        let rig = rig().await;
        let handle = rig.spawn(6, 2);
        rig.plc.drop_connection();
        let summary = handle.join().await.unwrap();
        assert!(!summary.trigger_cleared);
        assert_eq!(summary.read_failures, 2);
        assert_eq!(rig.stats.snapshot().trigger_clear_failures, 1);
    }
}
