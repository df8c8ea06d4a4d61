use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{BucketFactory, BucketId, BucketWriter, WriterError};
use crate::ack::MessageHandle;
use crate::event::Record;
use crate::metrics_consts::OPEN_BUCKETS_GAUGE;

/// A bucket file together with the handles of the messages durably written into it.
pub struct BucketEntry {
    pub writer: BucketWriter,
    /// Arrival order is preserved; acknowledged only after a successful upload.
    pub pending_acks: Vec<MessageHandle>,
    /// Set once the entry left the registry; holders of a stale handle must re-route.
    pub retired: bool,
}

impl BucketEntry {
    pub fn new(writer: BucketWriter) -> Self {
        Self {
            writer,
            pending_acks: Vec::new(),
            retired: false,
        }
    }
}

/// The lock serializes writes and upload for one bucket: whoever holds it owns the file.
pub type SharedBucket = Arc<Mutex<BucketEntry>>;

/// Exclusive owner of the bucket id -> bucket map.
pub struct BucketRegistry {
    factory: BucketFactory,
    buckets: DashMap<BucketId, SharedBucket>,
}

impl BucketRegistry {
    pub fn new(factory: BucketFactory) -> Self {
        Self {
            factory,
            buckets: DashMap::new(),
        }
    }

    pub fn route(&self, record: &Record) -> BucketId {
        self.factory.bucket_id(record)
    }

    pub fn route_and_get_writer(&self, record: &Record) -> Result<SharedBucket, WriterError> {
        self.get_or_create(&self.route(record))
    }

    /// Returns the bucket for `id`, creating its file on first use. Creation for one id
    /// happens under the map's shard lock, so there is never more than one writer per id.
    pub fn get_or_create(&self, id: &BucketId) -> Result<SharedBucket, WriterError> {
        match self.buckets.entry(id.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let writer = self.factory.create_writer(id)?;
                let bucket = Arc::new(Mutex::new(BucketEntry::new(writer)));
                entry.insert(bucket.clone());
                metrics::gauge!(OPEN_BUCKETS_GAUGE).increment(1.0);
                Ok(bucket)
            }
        }
    }

    pub fn get(&self, id: &BucketId) -> Option<SharedBucket> {
        self.buckets.get(id).map(|b| b.value().clone())
    }

    pub fn snapshot(&self) -> Vec<(BucketId, SharedBucket)> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Takes `bucket` out of routing, provided `id` still maps to it. `entry` must be the
    /// locked contents of `bucket`. Later records for `id` get a new bucket.
    pub fn retire(&self, id: &BucketId, bucket: &SharedBucket, entry: &mut BucketEntry) -> bool {
        entry.retired = true;
        let removed = self
            .buckets
            .remove_if(id, |_, current| Arc::ptr_eq(current, bucket))
            .is_some();
        if removed {
            metrics::gauge!(OPEN_BUCKETS_GAUGE).decrement(1.0);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn factory(&self) -> &BucketFactory {
        &self.factory
    }
}
