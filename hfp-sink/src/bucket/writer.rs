use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, NaiveDate};
use thiserror::Error;
use tracing::{debug, warn};

use super::BucketId;
use crate::dedup::Deduplicator;
use crate::event::schema::{format_date, format_instant, header, render_row};
use crate::event::Record;

const WRITE_BUFFER_SIZE: usize = 32 * 1024;

type CsvOut = csv::Writer<zstd::stream::write::Encoder<'static, BufWriter<File>>>;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("bucket file {0} has been closed for writing")]
    Closed(PathBuf),
    #[error("closing bucket file {0} failed earlier, contents are incomplete")]
    CloseFailed(PathBuf),
    #[error("I/O error on bucket file: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error on bucket file: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
    CloseFailed,
}

/// Outcome of [`BucketWriter::write_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Duplicate,
}

/// One zstd-compressed CSV file for one bucket.
///
/// Rows go through csv -> zstd -> buffered file, so memory stays bounded by the
/// compressor window regardless of file size.
pub struct BucketWriter {
    id: BucketId,
    path: PathBuf,
    out: Option<CsvOut>,
    state: State,
    compression_level: i32,
    header_len: usize,
    idle_threshold: Duration,
    last_write: Instant,
    dedup: Deduplicator<Record>,
    row_count: u64,
    min_tst: Option<DateTime<FixedOffset>>,
    max_tst: Option<DateTime<FixedOffset>>,
    min_oday: Option<NaiveDate>,
    max_oday: Option<NaiveDate>,
}

impl BucketWriter {
    /// Creates (truncating) the file at `path` and writes the category header.
    pub fn create(
        id: BucketId,
        path: PathBuf,
        compression_level: i32,
        idle_threshold: Duration,
    ) -> Result<Self, WriterError> {
        let mut out = Self::output(File::create(&path)?, compression_level)?;

        let columns = id.category.columns();
        out.write_record(header(columns))?;

        debug!(path = %path.display(), bucket = %id, "Created bucket file");

        Ok(Self {
            dedup: Deduplicator::for_records(id.category.expected_records_per_file()),
            header_len: columns.len(),
            id,
            path,
            out: Some(out),
            state: State::Open,
            compression_level,
            idle_threshold,
            last_write: Instant::now(),
            row_count: 0,
            min_tst: None,
            max_tst: None,
            min_oday: None,
            max_oday: None,
        })
    }

    fn output(file: File, compression_level: i32) -> Result<CsvOut, WriterError> {
        let encoder = zstd::stream::write::Encoder::new(
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            compression_level,
        )?;
        Ok(csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .terminator(csv::Terminator::CRLF)
            .from_writer(encoder))
    }

    /// Reopens a closed file for appending. New rows go into a second zstd frame after
    /// the finished one; decoders read concatenated frames as a single stream. Row
    /// count, ranges and the deduplicator carry over.
    pub fn reopen(&mut self) -> Result<(), WriterError> {
        match self.state {
            State::Open => return Ok(()),
            State::CloseFailed => return Err(WriterError::CloseFailed(self.path.clone())),
            State::Closed => {}
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.out = Some(Self::output(file, self.compression_level)?);
        self.state = State::Open;
        debug!(path = %self.path.display(), rows = self.row_count, "Reopened bucket file");
        Ok(())
    }

    /// Appends `record` unless an identical one (same event type, tst and vehicle) was
    /// already written to this file. Refreshes the idle clock either way.
    pub fn write_event(&mut self, record: &Record) -> Result<WriteOutcome, WriterError> {
        let out = match self.state {
            State::Open => self.out.as_mut().ok_or_else(|| WriterError::Closed(self.path.clone()))?,
            _ => return Err(WriterError::Closed(self.path.clone())),
        };

        let header_len = self.header_len;
        let written = self.dedup.consume_once(record, |record| {
            let row = render_row(record);
            if row.len() != header_len {
                warn!(
                    bucket = %self.id,
                    expected = header_len,
                    actual = row.len(),
                    row = row.join(","),
                    "CSV record has a different amount of values than the CSV header"
                );
            }
            out.write_record(&row)
        })?;

        self.last_write = Instant::now();

        if written.is_none() {
            return Ok(WriteOutcome::Duplicate);
        }

        self.row_count += 1;
        let tst = record.tst;
        if self.min_tst.map_or(true, |min| tst < min) {
            self.min_tst = Some(tst);
        }
        if self.max_tst.map_or(true, |max| tst > max) {
            self.max_tst = Some(tst);
        }
        if let Some(oday) = record.oday {
            if self.min_oday.map_or(true, |min| oday < min) {
                self.min_oday = Some(oday);
            }
            if self.max_oday.map_or(true, |max| oday > max) {
                self.max_oday = Some(oday);
            }
        }

        Ok(WriteOutcome::Written)
    }

    /// Flushes and finishes the compressed stream. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), WriterError> {
        match self.state {
            State::Closed => return Ok(()),
            State::CloseFailed => return Err(WriterError::CloseFailed(self.path.clone())),
            State::Open => {}
        }

        let Some(out) = self.out.take() else {
            self.state = State::Closed;
            return Ok(());
        };

        match Self::finish(out) {
            Ok(()) => {
                self.state = State::Closed;
                debug!(path = %self.path.display(), rows = self.row_count, "Closed bucket file");
                Ok(())
            }
            Err(e) => {
                self.state = State::CloseFailed;
                Err(e)
            }
        }
    }

    fn finish(mut out: CsvOut) -> Result<(), WriterError> {
        out.flush()?;
        let encoder = out
            .into_inner()
            .map_err(|e| io::Error::other(e.to_string()))?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// A failed close leaves a truncated file that must never be uploaded.
    pub fn is_poisoned(&self) -> bool {
        self.state == State::CloseFailed
    }

    #[cfg(test)]
    pub(crate) fn poison(&mut self) {
        self.out = None;
        self.state = State::CloseFailed;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_write.elapsed()
    }

    /// True once nothing was written for longer than the idle threshold. Buckets are
    /// keyed by receipt time, so a quiet bucket means its time slot has passed.
    pub fn is_ready_for_upload(&self) -> bool {
        self.is_ready_for_upload_at(Instant::now())
    }

    pub fn is_ready_for_upload_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_write) > self.idle_threshold
    }

    /// Blob metadata describing the file contents.
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::from([
            ("row_count".to_string(), self.row_count.to_string()),
            ("eventType".to_string(), self.id.event_type.clone()),
            ("category".to_string(), self.id.category.to_string()),
            ("private".to_string(), self.id.private.to_string()),
            ("invalid".to_string(), self.id.invalid.to_string()),
        ]);

        if let Some(min) = self.min_tst {
            metadata.insert("min_tst".to_string(), format_instant(min.to_utc()));
        }
        if let Some(max) = self.max_tst {
            metadata.insert("max_tst".to_string(), format_instant(max.to_utc()));
        }
        if let Some(min) = self.min_oday {
            metadata.insert("min_oday".to_string(), format_date(min));
        }
        if let Some(max) = self.max_oday {
            metadata.insert("max_oday".to_string(), format_date(max));
        }

        metadata
    }

    pub fn id(&self) -> &BucketId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}
