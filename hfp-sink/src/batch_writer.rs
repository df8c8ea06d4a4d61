use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::bucket::{BucketEntry, BucketId, BucketRegistry, WriteOutcome, WriterError};
use crate::metrics_consts::{
    DISCARDED_BUCKETS_COUNTER, DUPLICATES_SKIPPED_COUNTER, ROWS_WRITTEN_COUNTER,
    WRITE_FAULTS_COUNTER,
};
use crate::queue::QueuedRecord;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCycleStats {
    pub records: usize,
    pub buckets: usize,
    pub written: usize,
    pub duplicates: usize,
    pub faults: usize,
}

impl WriteCycleStats {
    fn merge(&mut self, other: WriteCycleStats) {
        self.written += other.written;
        self.duplicates += other.duplicates;
        self.faults += other.faults;
    }
}

/// Groups a drained batch by bucket and writes the groups in parallel.
///
/// One task owns one bucket's group for the whole cycle, so rows of a bucket keep their
/// arrival order. Handles are only added to a bucket's pending acknowledgements after
/// the record (or its duplicate) is in the file.
pub struct BatchWriter {
    registry: Arc<BucketRegistry>,
    workers: Arc<Semaphore>,
}

impl BatchWriter {
    pub fn new(registry: Arc<BucketRegistry>, worker_count: usize) -> Self {
        Self {
            registry,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
        }
    }

    /// Writes `batch` and returns once every group has been written.
    pub async fn write_batch(&self, batch: Vec<QueuedRecord>) -> WriteCycleStats {
        let mut stats = WriteCycleStats {
            records: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return stats;
        }

        let groups = group_by_bucket(&self.registry, batch);
        stats.buckets = groups.len();

        let mut tasks = JoinSet::new();
        for (id, items) in groups {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Writer pool closed, dropping write group");
                    stats.faults += items.len();
                    continue;
                }
            };
            let registry = self.registry.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                write_group(&registry, &id, items)
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(group_stats) => stats.merge(group_stats),
                Err(e) => error!(error = %e, "Bucket write task failed"),
            }
        }

        stats
    }
}

/// Groups records by destination bucket, keeping first-seen bucket order and the
/// arrival order within each group.
pub fn group_by_bucket(
    registry: &BucketRegistry,
    batch: Vec<QueuedRecord>,
) -> Vec<(BucketId, Vec<QueuedRecord>)> {
    let mut index: HashMap<BucketId, usize> = HashMap::new();
    let mut groups: Vec<(BucketId, Vec<QueuedRecord>)> = Vec::new();

    for item in batch {
        let id = registry.route(&item.record);
        match index.get(&id) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(id.clone(), groups.len());
                groups.push((id, vec![item]));
            }
        }
    }

    groups
}

/// Locks the bucket for `id` in a writable state.
///
/// A bucket whose upload failed is closed while it waits for the retry; it is reopened so
/// the new rows go out with that retry. A bucket whose close failed is discarded and
/// replaced. Its messages stay unacknowledged until redelivery.
fn lock_writable(
    registry: &BucketRegistry,
    id: &BucketId,
) -> Result<OwnedMutexGuard<BucketEntry>, WriterError> {
    loop {
        let bucket = registry.get_or_create(id)?;
        let mut entry = bucket.clone().blocking_lock_owned();
        if entry.retired {
            continue;
        }
        if entry.writer.is_poisoned() {
            error!(
                bucket = %id,
                messages = entry.pending_acks.len(),
                "Discarding bucket whose file could not be finalized"
            );
            metrics::counter!(DISCARDED_BUCKETS_COUNTER).increment(1);
            registry.retire(id, &bucket, &mut entry);
            continue;
        }
        if !entry.writer.is_open() {
            entry.writer.reopen()?;
        }
        return Ok(entry);
    }
}

fn write_group(registry: &BucketRegistry, id: &BucketId, items: Vec<QueuedRecord>) -> WriteCycleStats {
    let mut stats = WriteCycleStats::default();

    let mut entry = match lock_writable(registry, id) {
        Ok(entry) => entry,
        Err(e) => {
            error!(bucket = %id, error = %e, records = items.len(), "Failed to open bucket file");
            metrics::counter!(WRITE_FAULTS_COUNTER).increment(items.len() as u64);
            stats.faults = items.len();
            return stats;
        }
    };

    let category = id.category.as_str();
    for item in items {
        match entry.writer.write_event(&item.record) {
            Ok(outcome) => {
                entry.pending_acks.push(item.handle);
                match outcome {
                    WriteOutcome::Written => stats.written += 1,
                    WriteOutcome::Duplicate => stats.duplicates += 1,
                }
            }
            Err(e) => {
                warn!(
                    bucket = %id,
                    message = %item.handle,
                    error = %e,
                    "Failed to write record, message will not be acknowledged"
                );
                stats.faults += 1;
            }
        }
    }

    metrics::counter!(ROWS_WRITTEN_COUNTER, "category" => category).increment(stats.written as u64);
    metrics::counter!(DUPLICATES_SKIPPED_COUNTER, "category" => category)
        .increment(stats.duplicates as u64);
    if stats.faults > 0 {
        metrics::counter!(WRITE_FAULTS_COUNTER).increment(stats.faults as u64);
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::MessageHandle;
    use crate::bucket::BucketFactory;
    use crate::test_utils::{position_record, queued, read_bucket_file};
    use crate::validator::{TimestampValidator, ValidatorSet};

    fn registry(dir: &std::path::Path) -> Arc<BucketRegistry> {
        Arc::new(BucketRegistry::new(BucketFactory::new(
            dir,
            3,
            ValidatorSet::default(),
        )))
    }

    fn deadrun(offset: i64) -> QueuedRecord {
        let mut item = queued(offset);
        item.record.journey_type = Some("deadrun".to_string());
        item.record.category = crate::event::EventCategory::Unsigned;
        item
    }

    #[test]
    fn groups_preserve_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let batch = vec![queued(0), deadrun(1), queued(2), deadrun(3), queued(4)];
        let groups = group_by_bucket(&registry, batch);

        assert_eq!(groups.len(), 2);
        let offsets = |g: &Vec<QueuedRecord>| g.iter().map(|q| q.handle.offset).collect::<Vec<_>>();
        assert_eq!(offsets(&groups[0].1), vec![0, 2, 4]);
        assert_eq!(offsets(&groups[1].1), vec![1, 3]);
        assert!(groups[1].0.private);
    }

    #[tokio::test]
    async fn writes_groups_and_tracks_pending_acks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let writer = BatchWriter::new(registry.clone(), 2);

        let mut duplicate = queued(0);
        duplicate.handle = MessageHandle::new(0, 5);
        let batch = vec![queued(0), deadrun(1), queued(2), duplicate];

        let stats = writer.write_batch(batch).await;
        assert_eq!(stats.records, 4);
        assert_eq!(stats.buckets, 2);
        assert_eq!(stats.written, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.faults, 0);

        let public_id = registry.route(&position_record(0));
        let bucket = registry.get(&public_id).unwrap();
        let mut entry = bucket.lock().await;
        assert_eq!(
            entry.pending_acks,
            vec![MessageHandle::new(0, 0), MessageHandle::new(0, 2), MessageHandle::new(0, 5)]
        );

        entry.writer.close().unwrap();
        assert_eq!(read_bucket_file(entry.writer.path()).len(), 3);
    }

    #[tokio::test]
    async fn closed_bucket_is_reopened_for_late_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let writer = BatchWriter::new(registry.clone(), 1);

        writer.write_batch(vec![queued(0)]).await;
        let bucket = registry.get(&registry.route(&position_record(0))).unwrap();
        bucket.lock().await.writer.close().unwrap();

        let stats = writer.write_batch(vec![queued(1)]).await;
        assert_eq!(stats.faults, 0);
        assert_eq!(stats.written, 1);

        let mut entry = bucket.lock().await;
        assert!(entry.writer.is_open());
        assert_eq!(
            entry.pending_acks,
            vec![MessageHandle::new(0, 0), MessageHandle::new(0, 1)]
        );
        entry.writer.close().unwrap();
        assert_eq!(read_bucket_file(entry.writer.path()).len(), 3);
    }

    #[tokio::test]
    async fn poisoned_bucket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let writer = BatchWriter::new(registry.clone(), 1);

        writer.write_batch(vec![queued(0)]).await;
        let id = registry.route(&position_record(0));
        let poisoned = registry.get(&id).unwrap();
        poisoned.lock().await.writer.poison();

        let stats = writer.write_batch(vec![queued(1)]).await;
        assert_eq!(stats.faults, 0);
        assert_eq!(stats.written, 1);
        assert!(poisoned.lock().await.retired);

        let fresh = registry.get(&id).unwrap();
        assert!(!Arc::ptr_eq(&fresh, &poisoned));
        assert_eq!(fresh.lock().await.pending_acks, vec![MessageHandle::new(0, 1)]);
    }

    #[test]
    fn extreme_receipt_time_is_routed_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(BucketRegistry::new(BucketFactory::new(
            dir.path(),
            3,
            ValidatorSet::default().with(TimestampValidator::new(
                chrono::Duration::hours(1),
                chrono::Duration::minutes(1),
            )),
        )));

        let mut item = queued(0);
        item.record.received_at = Some(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let groups = group_by_bucket(&registry, vec![item, queued(1)]);

        assert_eq!(groups.len(), 2);
        assert!(groups[0].0.invalid);
        assert!(!groups[1].0.invalid);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let stats = BatchWriter::new(registry.clone(), 1).write_batch(Vec::new()).await;
        assert_eq!(stats, WriteCycleStats::default());
        assert!(registry.is_empty());
    }
}
