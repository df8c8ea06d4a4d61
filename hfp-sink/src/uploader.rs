use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::ack::Acknowledger;
use crate::bucket::{BucketEntry, BucketId, BucketRegistry, SharedBucket};
use crate::metrics_consts::{
    DISCARDED_BUCKETS_COUNTER, EMPTY_UPLOAD_CYCLES_GAUGE, UPLOADS_COUNTER,
    UPLOAD_DURATION_HISTOGRAM,
};
use crate::sink::Sink;

pub const DEFAULT_EMPTY_UPLOAD_WARNING_THRESHOLD: u32 = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadCycleStats {
    pub open: usize,
    pub ready: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Buckets skipped because a write batch held them
    pub busy: usize,
    /// Buckets dropped because their file could not be finalized
    pub discarded: usize,
}

enum BucketOutcome {
    Uploaded,
    Discarded,
}

/// Closes idle buckets, uploads them, acknowledges their messages and removes them.
///
/// A failed upload leaves the bucket closed in the registry for the next cycle. A bucket
/// whose file cannot be finalized is discarded without acknowledging its messages.
pub struct Uploader {
    registry: Arc<BucketRegistry>,
    public_sink: Arc<dyn Sink>,
    private_sink: Arc<dyn Sink>,
    acknowledger: Arc<dyn Acknowledger>,
    empty_cycles: u32,
    empty_cycle_warning_threshold: u32,
}

impl Uploader {
    pub fn new(
        registry: Arc<BucketRegistry>,
        public_sink: Arc<dyn Sink>,
        private_sink: Arc<dyn Sink>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            registry,
            public_sink,
            private_sink,
            acknowledger,
            empty_cycles: 0,
            empty_cycle_warning_threshold: DEFAULT_EMPTY_UPLOAD_WARNING_THRESHOLD,
        }
    }

    pub fn with_empty_cycle_warning_threshold(mut self, threshold: u32) -> Self {
        self.empty_cycle_warning_threshold = threshold;
        self
    }

    /// Consecutive cycles that uploaded nothing.
    pub fn empty_cycles(&self) -> u32 {
        self.empty_cycles
    }

    pub async fn run_cycle(&mut self) -> UploadCycleStats {
        let snapshot = self.registry.snapshot();
        let mut stats = UploadCycleStats {
            open: snapshot.len(),
            ..Default::default()
        };

        info!(buckets = snapshot.len(), "Uploading files to blob storage");

        for (id, bucket) in &snapshot {
            // A held lock means a write batch is in flight; the bucket is not idle anyway
            let Ok(mut entry) = bucket.clone().try_lock_owned() else {
                stats.busy += 1;
                continue;
            };
            if entry.retired {
                continue;
            }
            if entry.writer.is_poisoned() {
                self.discard(id, bucket, &mut entry).await;
                stats.discarded += 1;
                continue;
            }
            if !entry.writer.is_ready_for_upload() {
                continue;
            }
            stats.ready += 1;

            match self.upload_bucket(id, bucket, entry).await {
                Ok(BucketOutcome::Uploaded) => stats.uploaded += 1,
                Ok(BucketOutcome::Discarded) => stats.discarded += 1,
                Err(e) => {
                    error!(bucket = %id, "Failed to upload file to blob storage: {e:#}");
                    stats.failed += 1;
                }
            }
        }

        if stats.uploaded == 0 {
            self.empty_cycles += 1;
        } else {
            self.empty_cycles = 0;
        }
        metrics::gauge!(EMPTY_UPLOAD_CYCLES_GAUGE).set(self.empty_cycles as f64);

        if self.empty_cycles > self.empty_cycle_warning_threshold {
            warn!(
                cycles = self.empty_cycles,
                "No files have been uploaded in the last {} cycles, open files:\n{}",
                self.empty_cycles,
                describe_open_buckets(&snapshot)
            );
        }

        info!(
            uploaded = stats.uploaded,
            failed = stats.failed,
            busy = stats.busy,
            discarded = stats.discarded,
            "Done uploading files to blob storage"
        );
        stats
    }

    async fn upload_bucket(
        &self,
        id: &BucketId,
        bucket: &SharedBucket,
        entry: OwnedMutexGuard<BucketEntry>,
    ) -> Result<BucketOutcome> {
        let started = Instant::now();
        let sink = if id.private {
            &self.private_sink
        } else {
            &self.public_sink
        };

        let (mut entry, closed) = tokio::task::spawn_blocking(move || {
            let mut entry = entry;
            let closed = entry.writer.close();
            (entry, closed)
        })
        .await
        .context("Close task failed")?;
        if let Err(e) = closed {
            error!(bucket = %id, error = %e, "Failed to close bucket file");
            self.discard(id, bucket, &mut entry).await;
            return Ok(BucketOutcome::Discarded);
        }

        let path = entry.writer.path().to_path_buf();
        let blob_name = id.blob_name();
        let metadata = entry.writer.metadata();

        let uploaded = sink.upload(&path, &blob_name, &metadata).await;
        metrics::histogram!(UPLOAD_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        match uploaded {
            Ok(external) => {
                metrics::counter!(UPLOADS_COUNTER, "result" => "success", "sink" => sink.name().to_string())
                    .increment(1);
                debug!(bucket = %id, external, "Uploaded bucket file");
            }
            Err(e) => {
                metrics::counter!(UPLOADS_COUNTER, "result" => "failure", "sink" => sink.name().to_string())
                    .increment(1);
                return Err(e.context(format!("Upload of {path:?} to sink {} failed", sink.name())));
            }
        }

        let handles = std::mem::take(&mut entry.pending_acks);
        info!(
            bucket = %id,
            messages = handles.len(),
            "Acknowledging messages which were written to file {}",
            path.display()
        );
        let mut ack_failures = 0;
        for handle in handles {
            if self.acknowledger.acknowledge(handle).is_err() {
                ack_failures += 1;
            }
        }
        if ack_failures > 0 {
            warn!(bucket = %id, failures = ack_failures, "Some acknowledgements failed, messages may be redelivered");
        }

        self.registry.retire(id, bucket, &mut entry);
        drop(entry);

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete uploaded file");
        }

        Ok(BucketOutcome::Uploaded)
    }

    /// Drops a bucket whose file is unusable. Its messages stay pending, which holds back
    /// the committed offsets until they are redelivered.
    async fn discard(&self, id: &BucketId, bucket: &SharedBucket, entry: &mut BucketEntry) {
        error!(
            bucket = %id,
            messages = entry.pending_acks.len(),
            "Discarding bucket file, its messages will not be acknowledged"
        );
        metrics::counter!(DISCARDED_BUCKETS_COUNTER).increment(1);
        self.registry.retire(id, bucket, entry);

        let path = entry.writer.path();
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to delete discarded file");
            }
        }
    }
}

fn describe_open_buckets(snapshot: &[(BucketId, SharedBucket)]) -> String {
    snapshot
        .iter()
        .map(|(id, bucket)| match bucket.try_lock() {
            Ok(entry) => format!(
                "{} ({id}), last modified {}min ago",
                entry.writer.path().display(),
                entry.writer.idle_for().as_secs() / 60
            ),
            Err(_) => format!("{id}, write in progress"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
