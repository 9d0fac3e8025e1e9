//! Event sink: append-only persistence for the two record kinds.
//!
//! The poller writes [`IdentificationEvent`]s, sampling tasks write
//! [`SampleRecord`]s. Sinks are shared across tasks as `Arc<dyn EventSink>`,
//! so every method takes `&self` and implementations synchronize internally.
//!
//! # Available Sinks
//!
//! - [`memory::MemorySink`] - in-process store with failure injection
//! - [`csv_log::CsvSink`] - `box_log.csv` / `data_log.csv` (feature `storage_csv`)

#[cfg(feature = "storage_csv")]
pub mod csv_log;
pub mod memory;

#[cfg(feature = "storage_csv")]
pub use csv_log::CsvSink;
pub use memory::MemorySink;

use crate::address::Slot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by an event sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink was closed.
    #[error("sink is closed")]
    Closed,

    /// The backend refused the record.
    #[error("record rejected: {0}")]
    Rejected(String),

    /// Filesystem failure.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding failure.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// A box identified at the station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentificationEvent {
    /// Slot the identifier names, if it is a configured slot.
    pub slot: Option<Slot>,
    /// Identifier code read from the controller.
    pub identifier: i16,
    /// Text label (barcode) read from the controller.
    pub label: String,
    /// Time the event was recorded.
    pub timestamp: DateTime<Utc>,
}

impl IdentificationEvent {
    /// Stamp a new event with the current time.
    pub fn new(slot: Option<Slot>, identifier: i16, label: impl Into<String>) -> Self {
        Self {
            slot,
            identifier,
            label: label.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One measurement of a slot: power, voltage and two temperatures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Slot the sample was taken from.
    pub slot: Slot,
    /// Raw values in controller order.
    pub values: [f32; 4],
    /// Time the sample was taken.
    pub timestamp: DateTime<Utc>,
}

impl SampleRecord {
    /// Stamp a new record with the current time.
    pub fn new(slot: Slot, values: [f32; 4]) -> Self {
        Self {
            slot,
            values,
            timestamp: Utc::now(),
        }
    }

    /// Power channel.
    pub fn power(&self) -> f32 {
        self.values[0]
    }

    /// Voltage channel.
    pub fn voltage(&self) -> f32 {
        self.values[1]
    }

    /// First temperature channel.
    pub fn temperature1(&self) -> f32 {
        self.values[2]
    }

    /// Second temperature channel.
    pub fn temperature2(&self) -> f32 {
        self.values[3]
    }
}

/// Append-only store for identification events and samples.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist one identification event.
    async fn append_identification_event(&self, event: &IdentificationEvent)
        -> Result<(), SinkError>;

    /// Persist one sample record.
    async fn append_sample_record(&self, record: &SampleRecord) -> Result<(), SinkError>;

    /// Flush and release the backend. Later appends fail with [`SinkError::Closed`].
    async fn close(&self) -> Result<(), SinkError>;
}
