use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch_writer::{BatchWriter, WriteCycleStats};
use crate::bucket::BucketRegistry;
use crate::metrics_consts::{WRITE_CYCLE_DURATION_HISTOGRAM, WRITE_CYCLE_RECORDS_HISTOGRAM};
use crate::queue::QueueDrain;
use crate::uploader::{UploadCycleStats, Uploader};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub write_interval: Duration,
    pub upload_interval: Duration,
    /// Most records taken from the queue in one write cycle
    pub drain_limit: usize,
}

/// Drives the write and upload cycles from a single task, so the two never overlap.
pub struct Pipeline {
    drain: QueueDrain,
    writer: BatchWriter,
    uploader: Uploader,
    registry: Arc<BucketRegistry>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        drain: QueueDrain,
        writer: BatchWriter,
        uploader: Uploader,
        registry: Arc<BucketRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            drain,
            writer,
            uploader,
            registry,
            config,
        }
    }

    /// Drains the queue once and writes everything drained before returning.
    pub async fn run_write_cycle(&mut self) -> WriteCycleStats {
        let started = Instant::now();
        let batch = self.drain.drain(self.config.drain_limit);
        debug!(records = batch.len(), "Writing messages to CSV files");

        let stats = self.writer.write_batch(batch).await;

        let elapsed = started.elapsed();
        metrics::histogram!(WRITE_CYCLE_DURATION_HISTOGRAM).record(elapsed.as_secs_f64());
        metrics::histogram!(WRITE_CYCLE_RECORDS_HISTOGRAM).record(stats.records as f64);
        if stats.records > 0 {
            info!(
                records = stats.records,
                buckets = stats.buckets,
                written = stats.written,
                duplicates = stats.duplicates,
                faults = stats.faults,
                "Wrote {} messages to CSV files in {} ms",
                stats.records,
                elapsed.as_millis()
            );
        }
        stats
    }

    pub async fn run_upload_cycle(&mut self) -> UploadCycleStats {
        self.uploader.run_cycle().await
    }

    /// Runs until `shutdown` is cancelled. A started cycle always finishes; on shutdown
    /// the queue is drained one last time and open files are finalized on disk. Their
    /// messages stay unacknowledged and will be redelivered.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut write_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.write_interval,
            self.config.write_interval,
        );
        write_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let first_upload = initial_upload_delay(Utc::now(), self.config.upload_interval);
        info!(
            "First upload in {}s, then every {}s",
            first_upload.as_secs(),
            self.config.upload_interval.as_secs()
        );
        let mut upload_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + first_upload,
            self.config.upload_interval,
        );
        upload_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Pipeline shutting down");
                    break;
                }
                _ = write_interval.tick() => {
                    self.run_write_cycle().await;
                }
                _ = upload_interval.tick() => {
                    self.run_upload_cycle().await;
                }
            }
        }

        self.run_write_cycle().await;
        self.flush_open_buckets().await;
    }

    /// Finalizes every open file without uploading it.
    pub async fn flush_open_buckets(&self) {
        for (id, bucket) in self.registry.snapshot() {
            let result = tokio::task::spawn_blocking(move || bucket.blocking_lock().writer.close()).await;
            match result {
                Ok(Ok(())) => debug!(bucket = %id, "Flushed bucket file"),
                Ok(Err(e)) => warn!(bucket = %id, error = %e, "Failed to flush bucket file"),
                Err(e) => warn!(bucket = %id, error = %e, "Flush task failed"),
            }
        }
    }
}

/// Time until the next multiple of `period` since the Unix epoch, which for periods that
/// divide an hour lands on wall-clock boundaries (:00, :15, :30, :45 for 15 minutes).
pub fn initial_upload_delay(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1);
    let now_ms = u128::try_from(now.timestamp_millis()).unwrap_or_default();
    let remainder = now_ms % period_ms;
    if remainder == 0 {
        return Duration::ZERO;
    }
    let delay_ms = period_ms - remainder;
    Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
}
