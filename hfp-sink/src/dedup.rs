//! Per-file record deduplication.
//!
//! Only the 64-bit fingerprint of a record is kept, never the record itself, so a
//! bucket holding a few hundred thousand position updates costs a few MiB.

use std::collections::HashSet;
use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher13};

use crate::event::Record;

/// Content fingerprint over event type, `tst` in epoch millis and vehicle id.
pub fn fingerprint(record: &Record) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(record.event_type.as_deref().unwrap_or_default().as_bytes());
    hasher.write(&record.tst.timestamp_millis().to_be_bytes());
    hasher.write(record.unique_vehicle_id.as_deref().unwrap_or_default().as_bytes());
    let hash = hasher.finish128();
    hash.h1 ^ hash.h2
}

/// Passes each distinct value to a consumer exactly once over its lifetime.
pub struct Deduplicator<T> {
    seen: HashSet<u64>,
    key: fn(&T) -> u64,
}

impl<T> Deduplicator<T> {
    pub fn new(expected: usize, key: fn(&T) -> u64) -> Self {
        Self {
            seen: HashSet::with_capacity(expected),
            key,
        }
    }

    /// Marks the fingerprint of `value` as seen. Returns `true` if it already was.
    pub fn seen(&mut self, value: &T) -> bool {
        !self.seen.insert((self.key)(value))
    }

    /// Calls `consumer` iff `value` has not been seen before. The value is only marked
    /// seen once the consumer returned `Ok`, so a failed write can be retried.
    pub fn consume_once<R, E>(
        &mut self,
        value: &T,
        consumer: impl FnOnce(&T) -> Result<R, E>,
    ) -> Result<Option<R>, E> {
        let key = (self.key)(value);
        if self.seen.contains(&key) {
            return Ok(None);
        }
        let out = consumer(value)?;
        self.seen.insert(key);
        Ok(Some(out))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Deduplicator<Record> {
    pub fn for_records(expected: usize) -> Self {
        Self::new(expected, fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::position_record;

    #[test]
    fn consumes_values_only_once() {
        let mut dedup: Deduplicator<u64> = Deduplicator::new(10, |v| *v);
        let mut consumed = Vec::new();

        for v in [1u64, 2, 1, 3, 2, 1] {
            dedup
                .consume_once(&v, |v| {
                    consumed.push(*v);
                    Ok::<_, ()>(())
                })
                .unwrap();
        }

        assert_eq!(consumed, vec![1, 2, 3]);
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn failed_consumer_does_not_mark_seen() {
        let mut dedup: Deduplicator<u64> = Deduplicator::new(10, |v| *v);
        assert!(dedup.consume_once(&5, |_| Err::<(), _>("boom")).is_err());
        assert_eq!(dedup.consume_once(&5, |v| Ok::<_, ()>(*v)), Ok(Some(5)));
        assert_eq!(dedup.consume_once(&5, |v| Ok::<_, ()>(*v)), Ok(None));
    }

    #[test]
    fn fingerprint_ignores_non_identity_fields() {
        let a = position_record(1);
        let mut b = a.clone();
        b.uuid = uuid::Uuid::new_v4();
        b.spd = Some(99.0);
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let mut dedup = Deduplicator::for_records(100);
        assert!(!dedup.seen(&a));
        assert!(dedup.seen(&b));

        let mut other_vehicle = a.clone();
        other_vehicle.unique_vehicle_id = Some("22/1".to_string());
        assert_ne!(fingerprint(&a), fingerprint(&other_vehicle));
        assert_ne!(fingerprint(&a), fingerprint(&position_record(2)));
    }
}
