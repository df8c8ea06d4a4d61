//! Buckets: one output file per (time slot, category, event type, privacy, validity).

pub mod registry;
pub mod writer;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::debug;

use crate::event::{EventCategory, Record};
use crate::metrics_consts::INVALID_RECORDS_COUNTER;
use crate::validator::ValidatorSet;

pub use registry::{BucketEntry, BucketRegistry, SharedBucket};
pub use writer::{BucketWriter, WriteOutcome, WriterError};

/// Event types that always carry private data, regardless of journey type.
pub const PRIVATE_EVENT_TYPES: &[&str] = &["DA", "DOUT", "BA", "BOUT"];

pub const DEFAULT_SLOT_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId {
    /// `yyyy-MM-ddTHH-<slot>` of the receipt time in UTC, slots numbered from 1
    pub base_name: String,
    pub category: EventCategory,
    /// HFP event type code, e.g. `VP`
    pub event_type: String,
    pub private: bool,
    pub invalid: bool,
}

impl BucketId {
    /// File and blob name, e.g. `2021-01-01T06-1_utc_VP_private.csv.zst`.
    pub fn blob_name(&self) -> String {
        format!(
            "{}_utc_{}{}{}.csv.zst",
            self.base_name,
            self.event_type,
            if self.private { "_private" } else { "" },
            if self.invalid { "_invalid" } else { "" },
        )
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.blob_name())
    }
}

/// `yyyy-MM-ddTHH-<n>` where `n` is the 1-based `slot_minutes` window within the hour.
pub fn slot_base_name(at: DateTime<Utc>, slot_minutes: u32) -> String {
    let slot = 1 + at.minute() / slot_minutes.max(1);
    format!("{}-{}", at.format("%Y-%m-%dT%H"), slot)
}

pub fn is_private(record: &Record) -> bool {
    !record.is_revenue()
        || record
            .event_type
            .as_deref()
            .is_some_and(|t| PRIVATE_EVENT_TYPES.contains(&t))
}

/// Derives bucket identifiers from records and creates their writers.
pub struct BucketFactory {
    data_dir: PathBuf,
    compression_level: i32,
    slot_minutes: u32,
    idle_threshold: Duration,
    validators: ValidatorSet,
}

impl BucketFactory {
    pub fn new(data_dir: impl Into<PathBuf>, compression_level: i32, validators: ValidatorSet) -> Self {
        Self {
            data_dir: data_dir.into(),
            compression_level,
            slot_minutes: DEFAULT_SLOT_MINUTES,
            idle_threshold: Duration::from_secs(15 * 60),
            validators,
        }
    }

    pub fn with_slot_minutes(mut self, slot_minutes: u32) -> Self {
        self.slot_minutes = slot_minutes;
        self
    }

    pub fn with_idle_threshold(mut self, idle_threshold: Duration) -> Self {
        self.idle_threshold = idle_threshold;
        self
    }

    /// Depends only on the record and the validator set.
    pub fn bucket_id(&self, record: &Record) -> BucketId {
        let failures = self.validators.failures(record);
        for validator in &failures {
            metrics::counter!(INVALID_RECORDS_COUNTER, "validator" => *validator).increment(1);
        }
        if !failures.is_empty() {
            debug!(
                uuid = %record.uuid,
                vehicle = record.unique_vehicle_id.as_deref().unwrap_or_default(),
                ?failures,
                "Routing record to invalid bucket"
            );
        }

        BucketId {
            base_name: slot_base_name(record.routing_time(), self.slot_minutes),
            category: record.category,
            event_type: record.event_type.clone().unwrap_or_default(),
            private: is_private(record),
            invalid: !failures.is_empty(),
        }
    }

    pub fn create_writer(&self, id: &BucketId) -> Result<BucketWriter, WriterError> {
        BucketWriter::create(
            id.clone(),
            self.data_dir.join(id.blob_name()),
            self.compression_level,
            self.idle_threshold,
        )
    }
}
