//! # PLC DAQ Core Library
//!
//! Trigger-driven acquisition of box identification events and per-slot
//! measurements from an industrial controller.
//!
//! A single [`poller::TriggerPoller`] loop polls the controller for trigger
//! bits, records identification events and keeps one
//! [`sampling::SamplingTask`] running for every slot whose sampling trigger is
//! raised. All controller traffic, from the poller and every task, is
//! serialized through one [`guardian::LinkGuardian`].
//!
//! ## Crate Structure
//!
//! - **`address`**: slot numbering and the controller address layout.
//! - **`link`**: the `AddressableLink` capability, the S7 ISO-on-TCP client and
//!   an in-memory mock controller.
//! - **`guardian`**: exclusive access to the link and reconnection.
//! - **`poller`**: the control loop and process-level shutdown.
//! - **`lifecycle`**: the registry of running sampling tasks.
//! - **`sampling`**: the per-slot sampling task.
//! - **`sink`**: append-only persistence (CSV files or memory).
//! - **`stats`**: counters for absorbed failures and throughput.
//! - **`config`**: figment-based settings with validation.
//! - **`logging`**: tracing-subscriber setup.
//! - **`simulator`**: a simulated production line for `--simulate` runs.
//! - **`error`**: the `DaqError` taxonomy.

pub mod address;
pub mod config;
pub mod error;
pub mod guardian;
pub mod lifecycle;
pub mod link;
pub mod logging;
pub mod poller;
pub mod sampling;
pub mod simulator;
pub mod sink;
pub mod stats;

pub use address::{AddressLayout, BitAddress, Slot, TriggerState};
pub use config::Settings;
pub use error::{AppResult, DaqError};
pub use guardian::LinkGuardian;
pub use link::{AddressableLink, LinkError, MockPlc, S7Link, S7LinkConfig};
pub use poller::{CycleOutcome, ShutdownReport, TriggerPoller};
pub use sink::{EventSink, IdentificationEvent, MemorySink, SampleRecord, SinkError};
pub use stats::{AcquisitionStats, StatsSnapshot};
