//! In-memory doubles and record builders shared by unit and integration tests.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

use crate::ack::{AckError, Acknowledger, MessageHandle};
use crate::event::{EventCategory, Record};
use crate::queue::QueuedRecord;
use crate::sink::Sink;

/// 2021-01-01T08:00:00 in Helsinki (06:00 UTC).
pub fn base_tst() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2021-01-01T08:00:00+02:00").unwrap_or_default()
}

/// Revenue-service position update of vehicle `1/1`, `seconds` after [`base_tst`] and
/// received at that same instant.
pub fn position_record(seconds: i64) -> Record {
    let tst = base_tst() + Duration::seconds(seconds);
    let mut record = Record::new(EventCategory::VehiclePosition, tst);
    record.event_type = Some("VP".to_string());
    record.journey_type = Some("journey".to_string());
    record.unique_vehicle_id = Some("1/1".to_string());
    record.received_at = Some(tst.with_timezone(&Utc));
    record.oday = NaiveDate::from_ymd_opt(2021, 1, 1);
    record.start = NaiveTime::from_hms_opt(7, 55, 0);
    record.route = Some("1001".to_string());
    record.desi = Some("1".to_string());
    record.dir = Some(1);
    record.oper = Some(1);
    record.veh = Some(1);
    record.spd = Some(8.5);
    record.hdg = Some(90);
    record.latitude = Some(60.1699);
    record.longitude = Some(24.9384);
    record.tsi = Some(tst.timestamp());
    record
}

pub fn queued(offset: i64) -> QueuedRecord {
    QueuedRecord {
        record: position_record(offset),
        handle: MessageHandle::new(0, offset),
    }
}

/// Decompresses a bucket file and returns all CSV rows, header included.
pub fn read_bucket_file(path: &Path) -> Vec<Vec<String>> {
    let file = File::open(path).unwrap_or_else(|e| panic!("open {path:?}: {e}"));
    let decoder = zstd::stream::read::Decoder::new(file).unwrap_or_else(|e| panic!("zstd: {e}"));
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(decoder)
        .records()
        .map(|row| match row {
            Ok(row) => row.iter().map(str::to_string).collect(),
            Err(e) => panic!("csv: {e}"),
        })
        .collect()
}

/// Acknowledger that remembers every handle, optionally failing the next N calls.
#[derive(Default)]
pub struct RecordingAcknowledger {
    acked: Mutex<Vec<MessageHandle>>,
    failures_left: AtomicUsize,
}

impl RecordingAcknowledger {
    pub fn acked(&self) -> Vec<MessageHandle> {
        self.acked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

impl Acknowledger for RecordingAcknowledger {
    fn acknowledge(&self, handle: MessageHandle) -> Result<(), AckError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AckError::Store {
                handle,
                reason: "injected failure".to_string(),
            });
        }
        if let Ok(mut acked) = self.acked.lock() {
            acked.push(handle);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub path: PathBuf,
    pub blob_name: String,
    pub metadata: HashMap<String, String>,
    /// File contents at upload time, decompressed and parsed
    pub rows: Vec<Vec<String>>,
}

/// Sink keeping uploads in memory, optionally failing the next N calls.
pub struct MemorySink {
    name: String,
    uploads: Mutex<Vec<Upload>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uploads: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, failures: usize) -> Self {
        let sink = Self::new(name);
        sink.failures_left.store(failures, Ordering::SeqCst);
        sink
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        path: &Path,
        blob_name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("injected upload failure for {blob_name}");
        }

        let upload = Upload {
            path: path.to_path_buf(),
            blob_name: blob_name.to_string(),
            metadata: metadata.clone(),
            rows: read_bucket_file(path),
        };
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(upload);
        }
        Ok(blob_name.to_string())
    }
}
