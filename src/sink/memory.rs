//! In-memory event sink.
//!
//! Used by the simulator and by tests. Clones share storage, so a test can
//! keep one handle while the orchestrator writes through another.

use super::{EventSink, IdentificationEvent, SampleRecord, SinkError};
use crate::address::Slot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<IdentificationEvent>,
    samples: Vec<SampleRecord>,
    closed: bool,
    failing_events: u32,
    failing_samples: u32,
}

/// Event sink backed by two vectors.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identification events in append order.
    pub fn events(&self) -> Vec<IdentificationEvent> {
        self.state.lock().events.clone()
    }

    /// All sample records in append order.
    pub fn samples(&self) -> Vec<SampleRecord> {
        self.state.lock().samples.clone()
    }

    /// Sample records of one slot in append order.
    pub fn samples_for(&self, slot: Slot) -> Vec<SampleRecord> {
        self.state
            .lock()
            .samples
            .iter()
            .filter(|r| r.slot == slot)
            .cloned()
            .collect()
    }

    /// Whether [`EventSink::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Reject the next `count` identification events.
    pub fn fail_next_events(&self, count: u32) {
        self.state.lock().failing_events = count;
    }

    /// Reject the next `count` sample records.
    pub fn fail_next_samples(&self, count: u32) {
        self.state.lock().failing_samples = count;
    }
}

fn take_failure(remaining: &mut u32) -> Result<(), SinkError> {
    if *remaining > 0 {
        *remaining -= 1;
        return Err(SinkError::Rejected("injected failure".into()));
    }
    Ok(())
}

#[async_trait]
impl EventSink for MemorySink {
    async fn append_identification_event(
        &self,
        event: &IdentificationEvent,
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }
        take_failure(&mut state.failing_events)?;
        state.events.push(event.clone());
        Ok(())
    }

    async fn append_sample_record(&self, record: &SampleRecord) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }
        take_failure(&mut state.failing_samples)?;
        state.samples.push(record.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.state.lock().closed = true;
        Ok(())
    }
}
