//! CSV event sink.
//!
//! Writes two append-mode files into the output directory:
//!
//! - `box_log.csv`: `timestamp,slot,identifier,label`
//! - `data_log.csv`: `timestamp,slot,power,voltage,temperature1,temperature2`
//!
//! A header row is written only when a file is created empty, so restarts keep
//! appending to the same logs. Each record is flushed immediately.

use super::{EventSink, IdentificationEvent, SampleRecord, SinkError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the identification log.
pub const BOX_LOG_FILE: &str = "box_log.csv";
/// File name of the sample log.
pub const DATA_LOG_FILE: &str = "data_log.csv";

const BOX_HEADER: [&str; 4] = ["timestamp", "slot", "identifier", "label"];
const DATA_HEADER: [&str; 6] = [
    "timestamp",
    "slot",
    "power",
    "voltage",
    "temperature1",
    "temperature2",
];

struct Writers {
    boxes: csv::Writer<File>,
    data: csv::Writer<File>,
}

/// Event sink writing `box_log.csv` and `data_log.csv`.
pub struct CsvSink {
    dir: PathBuf,
    writers: Mutex<Option<Writers>>,
}

impl CsvSink {
    /// Open (or create) both logs in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let boxes = open_log(&dir.join(BOX_LOG_FILE), &BOX_HEADER)?;
        let data = open_log(&dir.join(DATA_LOG_FILE), &DATA_HEADER)?;
        info!(dir = %dir.display(), "CSV sink opened");
        Ok(Self {
            dir,
            writers: Mutex::new(Some(Writers { boxes, data })),
        })
    }

    /// Path of the identification log.
    pub fn box_log_path(&self) -> PathBuf {
        self.dir.join(BOX_LOG_FILE)
    }

    /// Path of the sample log.
    pub fn data_log_path(&self) -> PathBuf {
        self.dir.join(DATA_LOG_FILE)
    }
}

fn open_log(path: &Path, header: &[&str]) -> Result<csv::Writer<File>, SinkError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(header)?;
        writer.flush()?;
    }
    Ok(writer)
}

#[async_trait]
impl EventSink for CsvSink {
    async fn append_identification_event(
        &self,
        event: &IdentificationEvent,
    ) -> Result<(), SinkError> {
        let mut guard = self.writers.lock();
        let writers = guard.as_mut().ok_or(SinkError::Closed)?;
        let slot = event.slot.map(|s| s.to_string()).unwrap_or_default();
        writers.boxes.write_record([
            event.timestamp.to_rfc3339(),
            slot,
            event.identifier.to_string(),
            event.label.clone(),
        ])?;
        writers.boxes.flush()?;
        Ok(())
    }

    async fn append_sample_record(&self, record: &SampleRecord) -> Result<(), SinkError> {
        let mut guard = self.writers.lock();
        let writers = guard.as_mut().ok_or(SinkError::Closed)?;
        writers.data.write_record([
            record.timestamp.to_rfc3339(),
            record.slot.to_string(),
            record.power().to_string(),
            record.voltage().to_string(),
            record.temperature1().to_string(),
            record.temperature2().to_string(),
        ])?;
        writers.data.flush()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        if let Some(mut writers) = self.writers.lock().take() {
            writers.boxes.flush()?;
            writers.data.flush()?;
            info!(dir = %self.dir.display(), "CSV sink closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Slot;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_headers_and_rows() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::open(dir.path()).unwrap();
        let slot = Slot::new(3).unwrap();

        sink.append_identification_event(&IdentificationEvent::new(Some(slot), 3, "BOX-001"))
            .await
            .unwrap();
        sink.append_identification_event(&IdentificationEvent::new(None, 900, "BOX-002"))
            .await
            .unwrap();
        sink.append_sample_record(&SampleRecord::new(slot, [1.5, 230.0, 20.25, 21.0]))
            .await
            .unwrap();
        sink.close().await.unwrap();

        let boxes = std::fs::read_to_string(sink.box_log_path()).unwrap();
        let lines: Vec<&str> = boxes.lines().collect();
        assert_eq!(lines[0], "timestamp,slot,identifier,label");
        assert!(lines[1].ends_with(",3,3,BOX-001"));
        assert!(lines[2].ends_with(",,900,BOX-002"));

        let data = std::fs::read_to_string(sink.data_log_path()).unwrap();
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(
            lines[0],
            "timestamp,slot,power,voltage,temperature1,temperature2"
        );
        assert!(lines[1].ends_with(",3,1.5,230,20.25,21"));
    }

    #[tokio::test]
    async fn reopening_appends_without_second_header() {
        let dir = tempdir().unwrap();
        let slot = Slot::new(1).unwrap();
        for _ in 0..2 {
            let sink = CsvSink::open(dir.path()).unwrap();
            sink.append_sample_record(&SampleRecord::new(slot, [0.0; 4]))
                .await
                .unwrap();
            sink.close().await.unwrap();
        }
        let data = std::fs::read_to_string(dir.path().join(DATA_LOG_FILE)).unwrap();
        assert_eq!(data.lines().count(), 3);
        assert_eq!(data.matches("timestamp").count(), 1);
    }

    #[tokio::test]
    async fn closed_sink_rejects_appends() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::open(dir.path()).unwrap();
        sink.close().await.unwrap();
        let record = SampleRecord::new(Slot::new(1).unwrap(), [0.0; 4]);
        assert!(matches!(
            sink.append_sample_record(&record).await,
            Err(SinkError::Closed)
        ));
    }
}
