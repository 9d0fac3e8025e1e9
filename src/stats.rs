//! Acquisition counters.
//!
//! Failures that the orchestrator absorbs (dropped samples, refused connects,
//! sink errors) are counted here so that degraded acquisition stays visible.
//! One [`AcquisitionStats`] is shared by the guardian, the poller and every
//! sampling task.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated lock-free from any task.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    identification_events: AtomicU64,
    identification_failures: AtomicU64,
    samples_written: AtomicU64,
    sample_read_failures: AtomicU64,
    sink_failures: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    link_losses: AtomicU64,
    tasks_started: AtomicU64,
    tasks_stopped: AtomicU64,
    tasks_completed: AtomicU64,
    trigger_clear_failures: AtomicU64,
}

/// Point-in-time copy of [`AcquisitionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Identification events persisted.
    pub identification_events: u64,
    /// Identification events dropped because the sink failed.
    pub identification_failures: u64,
    /// Sample records persisted.
    pub samples_written: u64,
    /// Sample reads that failed and were skipped.
    pub sample_read_failures: u64,
    /// Records of either kind the sink rejected.
    pub sink_failures: u64,
    /// Connect attempts made by the guardian.
    pub connect_attempts: u64,
    /// Connect attempts that failed.
    pub connect_failures: u64,
    /// Times an established link was lost.
    pub link_losses: u64,
    /// Sampling tasks started.
    pub tasks_started: u64,
    /// Sampling tasks stopped because their trigger cleared or at shutdown.
    pub tasks_stopped: u64,
    /// Sampling tasks that ran out their own time budget.
    pub tasks_completed: u64,
    /// Trigger-bit clears that could not be written.
    pub trigger_clear_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AcquisitionStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_identification(&self) {
        bump(&self.identification_events);
    }

    pub(crate) fn record_identification_failure(&self) {
        bump(&self.identification_failures);
        bump(&self.sink_failures);
    }

    pub(crate) fn record_sample(&self) {
        bump(&self.samples_written);
    }

    pub(crate) fn record_sample_read_failure(&self) {
        bump(&self.sample_read_failures);
    }

    pub(crate) fn record_sink_failure(&self) {
        bump(&self.sink_failures);
    }

    pub(crate) fn record_connect_attempt(&self, success: bool) {
        bump(&self.connect_attempts);
        if !success {
            bump(&self.connect_failures);
        }
    }

    pub(crate) fn record_link_loss(&self) {
        bump(&self.link_losses);
    }

    pub(crate) fn record_task_started(&self) {
        bump(&self.tasks_started);
    }

    pub(crate) fn record_task_stopped(&self) {
        bump(&self.tasks_stopped);
    }

    pub(crate) fn record_task_completed(&self) {
        bump(&self.tasks_completed);
    }

    pub(crate) fn record_trigger_clear_failure(&self) {
        bump(&self.trigger_clear_failures);
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            identification_events: load(&self.identification_events),
            identification_failures: load(&self.identification_failures),
            samples_written: load(&self.samples_written),
            sample_read_failures: load(&self.sample_read_failures),
            sink_failures: load(&self.sink_failures),
            connect_attempts: load(&self.connect_attempts),
            connect_failures: load(&self.connect_failures),
            link_losses: load(&self.link_losses),
            tasks_started: load(&self.tasks_started),
            tasks_stopped: load(&self.tasks_stopped),
            tasks_completed: load(&self.tasks_completed),
            trigger_clear_failures: load(&self.trigger_clear_failures),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "boxes={} samples={} read_failures={} sink_failures={} connects={}/{} tasks={}+{}/{}",
            self.identification_events,
            self.samples_written,
            self.sample_read_failures,
            self.sink_failures,
            // Relaxed loads may observe a failure before its attempt.
            self.connect_attempts.saturating_sub(self.connect_failures),
            self.connect_attempts,
            self.tasks_completed,
            self.tasks_stopped,
            self.tasks_started,
        )
    }
}
