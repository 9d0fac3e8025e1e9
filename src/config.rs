//! Configuration using Figment
//!
//! Settings are loaded from a TOML file and then overridden by environment
//! variables prefixed with `PLC_DAQ_`. Nested keys are separated by a double
//! underscore, e.g. `PLC_DAQ_TIMING__POLL_INTERVAL=250ms` or
//! `PLC_DAQ_PLC__HOST=10.0.0.5`.
//!
//! Every section has defaults, so a file only needs to name what differs from
//! the line defaults. Durations use human-readable strings (`"500ms"`, `"1m"`).
//!
//! # Example
//! ```no_run
//! use plc_daq::config::Settings;
//!
//! let settings = Settings::load("config/plc_daq.toml")?;
//! println!("Polling {} every {:?}", settings.plc.host, settings.timing.poll_interval);
//! # Ok::<(), plc_daq::error::DaqError>(())
//! ```

use crate::address::{AddressLayout, SAMPLE_BLOCK_BYTES};
use crate::error::{AppResult, DaqError};
use crate::link::S7LinkConfig;
use crate::logging::{parse_log_level, OutputFormat};
use crate::sampling::SamplingTiming;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PLC_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Controller connection
    pub plc: S7LinkConfig,
    /// Address layout inside the controller's data block
    pub layout: AddressLayout,
    /// Cadences and budgets
    pub timing: TimingSettings,
    /// Event sink
    pub storage: StorageSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "plc-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Poll cadence, reconnect backoff and per-slot sampling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Trigger poller cadence
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Wait after a failed connect before the next attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    /// Time budget of one sampling task
    #[serde(with = "humantime_serde")]
    pub logging_duration: Duration,
    /// Pause between two samples of one slot
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            reconnect_backoff: Duration::from_secs(5),
            logging_duration: Duration::from_secs(60),
            sampling_interval: Duration::from_secs(1),
        }
    }
}

impl TimingSettings {
    /// Interval and budget handed to every sampling task.
    pub fn sampling(&self) -> SamplingTiming {
        SamplingTiming {
            interval: self.sampling_interval,
            duration: self.logging_duration,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// `box_log.csv` / `data_log.csv` in `output_dir`
    Csv,
    /// Keep records in memory (simulation, dry runs)
    Memory,
}

impl StorageBackend {
    /// Parse a backend name.
    pub fn parse(name: &str) -> AppResult<Self> {
        match name.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "memory" => Ok(Self::Memory),
            _ => Err(DaqError::Configuration(format!(
                "Invalid storage backend '{name}'. Must be one of: csv, memory"
            ))),
        }
    }
}

/// Event sink configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Storage backend (csv or memory)
    pub backend: String,
    /// Output directory for the CSV logs
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "csv".to_string(),
            output_dir: PathBuf::from("data"),
        }
    }
}

impl StorageSettings {
    /// The configured backend.
    pub fn backend(&self) -> AppResult<StorageBackend> {
        StorageBackend::parse(&self.backend)
    }
}

impl Settings {
    /// Load from `path` plus environment overrides, then validate.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Self::load_from(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` plus environment overrides without validating.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "Configuration file '{}' not found",
                path.display()
            )));
        }
        let settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;
        OutputFormat::parse(&self.application.log_format)?;
        self.storage.backend()?;

        if self.plc.host.trim().is_empty() {
            return invalid("plc.host must not be empty");
        }

        self.validate_layout()?;
        self.validate_timing()
    }

    fn validate_layout(&self) -> AppResult<()> {
        let layout = &self.layout;
        if layout.slot_count == 0 {
            return invalid("layout.slot_count must be > 0");
        }
        if layout.bitmap_capacity() < u32::from(layout.slot_count) {
            return invalid(format!(
                "layout.sampling_bitmap_length of {} bytes holds {} bits, fewer than {} slots",
                layout.sampling_bitmap_length,
                layout.bitmap_capacity(),
                layout.slot_count
            ));
        }
        if layout.identification_trigger.bit > 7 {
            return invalid(format!(
                "layout.identification_trigger.bit {} must be 0-7",
                layout.identification_trigger.bit
            ));
        }
        if layout.label_length == 0 {
            return invalid("layout.label_length must be > 0");
        }
        if layout.data_stride < SAMPLE_BLOCK_BYTES {
            return invalid(format!(
                "layout.data_stride {} is smaller than one {}-byte sample block",
                layout.data_stride, SAMPLE_BLOCK_BYTES
            ));
        }

        let ranges = layout
            .occupied_ranges()
            .map_err(DaqError::Configuration)?;
        for (i, (name_a, start_a, end_a)) in ranges.iter().enumerate() {
            for (name_b, start_b, end_b) in &ranges[i + 1..] {
                if start_a < end_b && start_b < end_a {
                    return invalid(format!(
                        "layout fields '{name_a}' ({start_a}..{end_a}) and '{name_b}' ({start_b}..{end_b}) overlap"
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_timing(&self) -> AppResult<()> {
        let timing = &self.timing;
        for (name, value) in [
            ("poll_interval", timing.poll_interval),
            ("reconnect_backoff", timing.reconnect_backoff),
            ("logging_duration", timing.logging_duration),
            ("sampling_interval", timing.sampling_interval),
        ] {
            if value.is_zero() {
                return invalid(format!("timing.{name} must be > 0"));
            }
        }
        if timing.sampling_interval > timing.logging_duration {
            return invalid(format!(
                "timing.sampling_interval {:?} exceeds timing.logging_duration {:?}",
                timing.sampling_interval, timing.logging_duration
            ));
        }
        if self.plc.connect_timeout.is_zero() || self.plc.request_timeout.is_zero() {
            return invalid("plc connect_timeout and request_timeout must be > 0");
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> AppResult<()> {
    Err(DaqError::Configuration(message.into()))
}
