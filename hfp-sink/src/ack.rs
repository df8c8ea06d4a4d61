use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::health::ActivityTracker;
use crate::metrics_consts::{ACKS_COUNTER, OLDEST_PENDING_AGE_GAUGE};

/// Opaque reference to a source message, acknowledged once its data is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle {
    pub partition: i32,
    pub offset: i64,
}

impl MessageHandle {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

#[derive(Error, Debug)]
pub enum AckError {
    #[error("message {0} was never registered with the acknowledger")]
    Unknown(MessageHandle),
    #[error("failed to store offset for {handle}: {reason}")]
    Store {
        handle: MessageHandle,
        reason: String,
    },
}

/// Acknowledges source messages. Called from blocking and async contexts alike, so
/// implementations must not block for long.
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, handle: MessageHandle) -> Result<(), AckError>;
}

/// Counts acknowledgement outcomes and logs failures.
pub struct TrackedAcknowledger {
    inner: Arc<dyn Acknowledger>,
}

impl TrackedAcknowledger {
    pub fn new(inner: Arc<dyn Acknowledger>) -> Self {
        Self { inner }
    }
}

impl Acknowledger for TrackedAcknowledger {
    fn acknowledge(&self, handle: MessageHandle) -> Result<(), AckError> {
        match self.inner.acknowledge(handle) {
            Ok(()) => {
                metrics::counter!(ACKS_COUNTER, "result" => "success").increment(1);
                Ok(())
            }
            Err(e) => {
                warn!(message = %handle, error = %e, "Failed to acknowledge message");
                metrics::counter!(ACKS_COUNTER, "result" => "failure").increment(1);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Offset to the instant it was registered
    pending: BTreeMap<i64, Instant>,
    highest: Option<i64>,
    stored: Option<i64>,
}

/// Per-partition bookkeeping of received and acknowledged offsets.
///
/// Acknowledgements arrive out of order (buckets upload independently), but a Kafka
/// commit is a single position. The committable position is the lowest offset still
/// pending, or one past the highest offset seen once nothing is pending.
#[derive(Debug, Default)]
pub struct OffsetWatermarks {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetWatermarks {
    pub fn register(&mut self, handle: MessageHandle) {
        let partition = self.partitions.entry(handle.partition).or_default();
        partition.pending.entry(handle.offset).or_insert_with(Instant::now);
        partition.highest = Some(partition.highest.map_or(handle.offset, |h| h.max(handle.offset)));
    }

    /// Marks `handle` done and returns the new offset to store, if it advanced.
    pub fn acknowledge(&mut self, handle: MessageHandle) -> Result<Option<i64>, AckError> {
        let partition = self
            .partitions
            .get_mut(&handle.partition)
            .ok_or(AckError::Unknown(handle))?;
        if partition.pending.remove(&handle.offset).is_none() {
            return Err(AckError::Unknown(handle));
        }

        let next = match partition.pending.first_key_value() {
            Some((lowest, _)) => *lowest,
            None => partition.highest.map_or(handle.offset + 1, |h| h + 1),
        };
        if partition.stored.is_some_and(|stored| stored >= next) {
            return Ok(None);
        }
        partition.stored = Some(next);
        debug!(partition = handle.partition, offset = next, "Advanced committable offset");
        Ok(Some(next))
    }

    /// Forgets all state for a partition, e.g. after it was revoked.
    pub fn forget_partition(&mut self, partition: i32) {
        self.partitions.remove(&partition);
    }

    pub fn pending(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |p| p.pending.len())
    }

    /// Registration time of the oldest message still waiting for acknowledgement.
    pub fn oldest_pending(&self) -> Option<Instant> {
        self.partitions
            .values()
            .filter_map(|p| p.pending.values().min().copied())
            .min()
    }
}

/// Shared [`OffsetWatermarks`] that publishes the oldest pending message to the
/// [`ActivityTracker`] after every change.
///
/// A message stuck in a bucket that never uploads keeps its registration time, so the
/// age keeps growing even while other buckets are acknowledged.
pub struct PendingOffsets {
    marks: Mutex<OffsetWatermarks>,
    activity: Arc<ActivityTracker>,
}

impl PendingOffsets {
    pub fn new(activity: Arc<ActivityTracker>) -> Self {
        Self {
            marks: Mutex::new(OffsetWatermarks::default()),
            activity,
        }
    }

    pub fn register(&self, handle: MessageHandle) {
        self.update(|marks| marks.register(handle));
    }

    /// See [`OffsetWatermarks::acknowledge`].
    pub fn acknowledge(&self, handle: MessageHandle) -> Result<Option<i64>, AckError> {
        self.update(|marks| marks.acknowledge(handle))
    }

    pub fn forget_partition(&self, partition: i32) {
        self.update(|marks| marks.forget_partition(partition));
    }

    pub fn pending(&self, partition: i32) -> usize {
        self.marks.lock().map_or(0, |marks| marks.pending(partition))
    }

    fn update<T>(&self, f: impl FnOnce(&mut OffsetWatermarks) -> T) -> T {
        // a panic while holding the lock leaves the map consistent, keep using it
        let mut marks = self.marks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = f(&mut marks);
        let oldest = marks.oldest_pending();
        drop(marks);

        self.activity.set_oldest_pending(oldest);
        let age = oldest.map_or(0.0, |at| at.elapsed().as_secs_f64());
        metrics::gauge!(OLDEST_PENDING_AGE_GAUGE).set(age);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingAcknowledger;

    #[test]
    fn watermark_waits_for_lowest_pending_offset() {
        let mut marks = OffsetWatermarks::default();
        for offset in 10..15 {
            marks.register(MessageHandle::new(0, offset));
        }

        assert_eq!(marks.acknowledge(MessageHandle::new(0, 12)).unwrap(), Some(10));
        assert_eq!(marks.acknowledge(MessageHandle::new(0, 11)).unwrap(), None);
        assert_eq!(marks.acknowledge(MessageHandle::new(0, 10)).unwrap(), Some(13));
        assert_eq!(marks.acknowledge(MessageHandle::new(0, 14)).unwrap(), None);
        assert_eq!(marks.acknowledge(MessageHandle::new(0, 13)).unwrap(), Some(15));
        assert_eq!(marks.pending(0), 0);
    }

    #[test]
    fn partitions_are_independent() {
        let mut marks = OffsetWatermarks::default();
        marks.register(MessageHandle::new(0, 1));
        marks.register(MessageHandle::new(1, 100));

        assert_eq!(marks.acknowledge(MessageHandle::new(1, 100)).unwrap(), Some(101));
        assert_eq!(marks.pending(0), 1);
    }

    #[test]
    fn unknown_or_repeated_ack_is_an_error() {
        let mut marks = OffsetWatermarks::default();
        marks.register(MessageHandle::new(0, 1));
        assert!(marks.acknowledge(MessageHandle::new(3, 1)).is_err());
        marks.acknowledge(MessageHandle::new(0, 1)).unwrap();
        assert!(marks.acknowledge(MessageHandle::new(0, 1)).is_err());

        marks.forget_partition(0);
        assert_eq!(marks.pending(0), 0);
    }

    #[test]
    fn oldest_pending_follows_the_lowest_registration() {
        let mut marks = OffsetWatermarks::default();
        assert!(marks.oldest_pending().is_none());

        marks.register(MessageHandle::new(0, 5));
        let first = marks.oldest_pending().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        marks.register(MessageHandle::new(1, 1));
        marks.register(MessageHandle::new(0, 6));
        assert_eq!(marks.oldest_pending(), Some(first));

        marks.acknowledge(MessageHandle::new(0, 5)).unwrap();
        assert!(marks.oldest_pending().unwrap() > first);
    }

    #[test]
    fn pending_offsets_publish_oldest_age() {
        let activity = Arc::new(ActivityTracker::new());
        let offsets = PendingOffsets::new(activity.clone());

        offsets.register(MessageHandle::new(0, 1));
        offsets.register(MessageHandle::new(0, 2));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(activity.oldest_pending_age().unwrap() >= std::time::Duration::from_millis(10));

        // a later acknowledgement does not hide the stuck one
        assert_eq!(offsets.acknowledge(MessageHandle::new(0, 2)).unwrap(), Some(1));
        assert!(activity.oldest_pending_age().is_some());

        assert_eq!(offsets.acknowledge(MessageHandle::new(0, 1)).unwrap(), Some(3));
        assert!(activity.oldest_pending_age().is_none());
    }

    #[test]
    fn forgotten_partition_is_no_longer_pending() {
        let activity = Arc::new(ActivityTracker::new());
        let offsets = PendingOffsets::new(activity.clone());
        offsets.register(MessageHandle::new(4, 10));
        assert_eq!(offsets.pending(4), 1);

        offsets.forget_partition(4);
        assert_eq!(offsets.pending(4), 0);
        assert!(activity.oldest_pending_age().is_none());
        assert!(offsets.acknowledge(MessageHandle::new(4, 10)).is_err());
    }

    #[test]
    fn tracked_acknowledger_passes_results_through() {
        let inner = Arc::new(RecordingAcknowledger::default());
        let tracked = TrackedAcknowledger::new(inner.clone());

        tracked.acknowledge(MessageHandle::new(0, 7)).unwrap();
        assert_eq!(inner.acked(), vec![MessageHandle::new(0, 7)]);

        inner.fail_next(1);
        assert!(tracked.acknowledge(MessageHandle::new(0, 8)).is_err());
        assert_eq!(inner.acked().len(), 1);
    }
}
