//! End-to-end acquisition scenarios against the mock controller.
//!
//! Cycles are driven by hand (`poll_once` followed by one poll interval of
//! paused time) so every assertion sees a deterministic interleaving of the
//! poller and the sampling tasks.

use plc_daq::address::{AddressLayout, BitAddress, Slot};
use plc_daq::config::TimingSettings;
use plc_daq::lifecycle::ReconcileReport;
use plc_daq::{
    AcquisitionStats, CycleOutcome, LinkGuardian, MemorySink, MockPlc, TriggerPoller,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_test::traced_test;

const POLL: Duration = Duration::from_millis(10);
const INTERVAL: Duration = Duration::from_millis(100);
const REGION: u16 = 1;

struct Line {
    plc: MockPlc,
    sink: MemorySink,
    layout: AddressLayout,
    stats: Arc<AcquisitionStats>,
    poller: TriggerPoller<MockPlc>,
}

impl Line {
    fn new(budget_intervals: u32) -> Self {
        Self::with_plc(MockPlc::with_region(REGION), budget_intervals)
    }

    fn with_plc(plc: MockPlc, budget_intervals: u32) -> Self {
        let sink = MemorySink::new();
        let stats = Arc::new(AcquisitionStats::new());
        let layout = AddressLayout::default();
        let timing = TimingSettings {
            poll_interval: POLL,
            reconnect_backoff: Duration::from_millis(50),
            logging_duration: INTERVAL * budget_intervals,
            sampling_interval: INTERVAL,
        };
        let poller = TriggerPoller::new(
            layout.clone(),
            timing,
            LinkGuardian::new(plc.clone(), Arc::clone(&stats)),
            Arc::new(sink.clone()),
            Arc::clone(&stats),
        );
        Self {
            plc,
            sink,
            layout,
            stats,
            poller,
        }
    }

    fn trigger(&self, n: u16) -> BitAddress {
        self.layout.sampling_trigger(slot(n))
    }

    fn raise(&self, n: u16) {
        self.plc.set_bit(REGION, self.trigger(n), true);
    }

    fn release(&self, n: u16) {
        self.plc.set_bit(REGION, self.trigger(n), false);
    }

    /// One poll cycle plus the cadence sleep.
    async fn cycle(&mut self) -> CycleOutcome {
        let outcome = self.poller.poll_once().await;
        tokio::time::sleep(POLL).await;
        outcome
    }

    async fn run_for(&mut self, span: Duration) {
        let start = Instant::now();
        while start.elapsed() < span {
            self.cycle().await;
        }
    }
}

fn slot(n: u16) -> Slot {
    Slot::new(n).unwrap()
}

fn reconciled(outcome: CycleOutcome) -> ReconcileReport {
    match outcome {
        CycleOutcome::Reconciled(report) => report,
        other => panic!("expected a reconciled cycle, got {other:?}"),
    }
}

// =============================================================================
// Scenario A: identification pulse
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_a_identification_pulse_yields_exactly_one_event() {
    let mut line = Line::new(10);
    let l = line.layout.clone();
    line.plc.set_word16(REGION, l.identifier_offset, 42);
    line.plc
        .set_text(REGION, l.label_offset, l.label_length, "BOX-001");
    line.plc.set_bit(REGION, l.identification_trigger, true);

    line.cycle().await;
    line.cycle().await;
    line.cycle().await;

    let events = line.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].identifier, 42);
    assert_eq!(events[0].label, "BOX-001");
    // 42 is not one of the 32 configured slots.
    assert_eq!(events[0].slot, None);

    assert!(!line.plc.bit(REGION, l.identification_trigger));
    assert_eq!(
        line.plc.bit_writes_at(REGION, l.identification_trigger),
        vec![false]
    );
    assert_eq!(line.stats.snapshot().identification_events, 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_pulses_are_recorded_in_order() {
    let mut line = Line::new(10);
    let l = line.layout.clone();

    for (id, label) in [(1, "BOX-A"), (2, "BOX-B"), (3, "BOX-C")] {
        line.plc.set_word16(REGION, l.identifier_offset, id);
        line.plc.set_text(REGION, l.label_offset, l.label_length, label);
        line.plc.set_bit(REGION, l.identification_trigger, true);
        line.cycle().await;
    }

    let labels: Vec<String> = line.sink.events().into_iter().map(|e| e.label).collect();
    assert_eq!(labels, vec!["BOX-A", "BOX-B", "BOX-C"]);
    assert_eq!(line.sink.events()[1].slot, Some(slot(2)));
}

// =============================================================================
// Scenario B: external stop after 2.5 intervals
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_b_external_stop_after_two_and_a_half_intervals() {
    let mut line = Line::new(10);
    line.raise(3);

    let report = reconciled(line.cycle().await);
    assert_eq!(report.started, vec![slot(3)]);

    line.run_for(INTERVAL * 5 / 2 - POLL).await;
    line.release(3);
    let report = reconciled(line.poller.poll_once().await);

    assert_eq!(report.stopped, vec![slot(3)]);
    assert_eq!(line.sink.samples_for(slot(3)).len(), 3);
    assert_eq!(line.plc.bit_writes_at(REGION, line.trigger(3)), vec![false]);
    assert!(!line.poller.manager().is_active(slot(3)));
}

#[tokio::test(start_paused = true)]
async fn samples_of_one_slot_are_chronological() {
    let mut line = Line::new(5);
    line.raise(7);
    line.run_for(INTERVAL * 6).await;

    let samples = line.sink.samples_for(slot(7));
    assert_eq!(samples.len(), 5);
    assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

// =============================================================================
// Scenario C: transient bitmap read failure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_c_unreadable_bitmap_changes_nothing_that_cycle() {
    let mut line = Line::new(50);
    line.raise(2);
    reconciled(line.cycle().await);

    line.release(2);
    line.raise(5);
    let bitmap_offset = line.layout.sampling_bitmap_offset;
    line.plc.fail_next_reads_at(REGION, bitmap_offset, 1);

    assert_eq!(line.cycle().await, CycleOutcome::BitmapUnavailable);
    assert_eq!(line.poller.manager().active_slots(), vec![slot(2)]);

    let report = reconciled(line.cycle().await);
    assert_eq!(report.started, vec![slot(5)]);
    assert_eq!(report.stopped, vec![slot(2)]);
    assert_eq!(line.poller.manager().active_slots(), vec![slot(5)]);
}

// =============================================================================
// Scenario D: link loss with two active tasks
// =============================================================================

#[tokio::test(start_paused = true)]
#[traced_test]
async fn scenario_d_link_loss_keeps_tasks_without_duplicates() {
    let mut line = Line::new(10);
    line.raise(1);
    line.raise(2);
    line.run_for(INTERVAL * 2).await;
    assert_eq!(line.poller.manager().len(), 2);

    line.plc.refuse_connect(true);
    line.plc.drop_connection();
    let reads_before = line.plc.read_count();
    let writes_before = line.plc.bit_writes().len();

    let start = Instant::now();
    while start.elapsed() < INTERVAL * 3 {
        assert_eq!(line.cycle().await, CycleOutcome::Disconnected);
    }
    assert_eq!(line.plc.read_count(), reads_before, "no reads while down");
    assert_eq!(line.plc.bit_writes().len(), writes_before);
    assert_eq!(line.poller.manager().len(), 2);
    assert!(logs_contain("Controller unreachable"));

    line.plc.refuse_connect(false);
    let report = reconciled(line.cycle().await);
    assert!(report.started.is_empty());
    assert_eq!(
        line.poller.manager().active_slots(),
        vec![slot(1), slot(2)]
    );

    line.run_for(INTERVAL * 6).await;
    let stats = line.stats.snapshot();
    assert_eq!(stats.tasks_started, 2);
    assert_eq!(stats.tasks_completed, 2);
    assert!(stats.sample_read_failures >= 4);
    for n in [1, 2] {
        let written = line.sink.samples_for(slot(n)).len();
        assert!(written < 10, "slot {n} wrote {written} samples");
        assert_eq!(line.plc.bit_writes_at(REGION, line.trigger(n)), vec![false]);
    }
    assert!(line.poller.manager().is_empty());
}

// =============================================================================
// Registry properties
// =============================================================================

#[tokio::test(start_paused = true)]
async fn held_trigger_never_starts_a_second_task() {
    let mut line = Line::new(10);
    line.raise(4);
    for _ in 0..20 {
        line.cycle().await;
        assert!(line.poller.manager().len() <= 1);
    }
    assert_eq!(line.stats.snapshot().tasks_started, 1);
}

#[tokio::test(start_paused = true)]
async fn task_self_clears_once_and_is_reaped() {
    let mut line = Line::new(3);
    line.raise(6);
    line.run_for(INTERVAL * 5).await;

    assert!(line.poller.manager().is_empty());
    assert!(!line.plc.bit(REGION, line.trigger(6)));
    assert_eq!(line.plc.bit_writes_at(REGION, line.trigger(6)), vec![false]);
    assert_eq!(line.sink.samples_for(slot(6)).len(), 3);
    assert_eq!(line.stats.snapshot().tasks_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn trigger_raised_again_after_budget_restarts_on_next_cycle() {
    let mut line = Line::new(2);
    line.raise(1);
    let report = reconciled(line.poller.poll_once().await);
    assert_eq!(report.started, vec![slot(1)]);

    // The task runs out its budget and self-clears while nobody polls,
    // then the controller raises the trigger again.
    tokio::time::sleep(INTERVAL * 3).await;
    assert!(!line.plc.bit(REGION, line.trigger(1)));
    line.raise(1);

    let report = reconciled(line.poller.poll_once().await);
    assert_eq!(report.reaped, vec![slot(1)]);
    assert_eq!(report.started, vec![slot(1)]);
    assert!(line.poller.manager().is_active(slot(1)));

    let stats = line.stats.snapshot();
    assert_eq!(stats.tasks_started, 2);
    assert_eq!(stats.tasks_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn every_slot_can_sample_concurrently_without_overlapping_link_access() {
    let plc = MockPlc::with_region(REGION).with_latency(Duration::from_millis(1));
    let mut line = Line::with_plc(plc, 4);
    for n in 1..=32 {
        line.raise(n);
    }

    line.run_for(INTERVAL * 6).await;

    assert_eq!(line.plc.overlap_violations(), 0);
    assert_eq!(line.stats.snapshot().tasks_started, 32);
    for n in 1..=32 {
        assert!(!line.sink.samples_for(slot(n)).is_empty());
        assert_eq!(line.plc.bit_writes_at(REGION, line.trigger(n)), vec![false]);
    }
}
