//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition service.
//! Using the `thiserror` crate, it gives every layer a consistent way to report what
//! went wrong, from an unreachable controller to a persistence failure.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the failure classes the orchestrator distinguishes:
//!
//! - **`LinkUnavailable`**: connecting or reconnecting to the controller failed. Recoverable;
//!   the trigger poller backs off and retries on a later cycle.
//! - **`LinkIo`**: a read or write on an otherwise connected link failed. Recoverable; the
//!   individual operation is skipped and retried on the next cycle or iteration.
//! - **`SinkWrite`**: the event sink rejected a record. Recoverable; the record is dropped
//!   and counted in [`crate::stats::AcquisitionStats`].
//! - **`Configuration`** / **`ConfigLoad`**: missing or invalid address or timing
//!   configuration. Fatal, and only ever raised at startup.
//!
//! Lower layers define their own narrow error types ([`crate::link::LinkError`],
//! [`crate::sink::SinkError`]) which convert into `DaqError` through `#[from]`.

use crate::link::LinkError;
use crate::sink::SinkError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition service.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The controller link could not be (re-)established.
    #[error("Controller link unavailable: {0}")]
    LinkUnavailable(#[source] LinkError),

    /// A read or write on a connected link failed.
    #[error("Controller link I/O failure: {0}")]
    LinkIo(#[from] LinkError),

    /// The event sink rejected a record.
    #[error("Sink write failure: {0}")]
    SinkWrite(#[from] SinkError),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration sources could not be read or deserialized.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),
}

impl DaqError {
    /// Classify a failed connect attempt.
    pub fn link_unavailable(err: LinkError) -> Self {
        DaqError::LinkUnavailable(err)
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}
