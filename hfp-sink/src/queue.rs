use thiserror::Error;
use tokio::sync::mpsc;

use crate::ack::MessageHandle;
use crate::event::Record;
use crate::metrics_consts::QUEUE_DEPTH_GAUGE;

pub const DEFAULT_QUEUE_CAPACITY: usize = 750_000;

/// A parsed record and the message it came from.
#[derive(Debug, Clone)]
pub struct QueuedRecord {
    pub record: Record,
    pub handle: MessageHandle,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("ingestion queue is closed")]
    Closed(Box<QueuedRecord>),
}

/// Creates a bounded ingestion queue: any number of producers, one draining side.
pub fn ingestion_queue(capacity: usize) -> (QueueProducer, QueueDrain) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (QueueProducer { sender }, QueueDrain { receiver })
}

#[derive(Clone)]
pub struct QueueProducer {
    sender: mpsc::Sender<QueuedRecord>,
}

impl QueueProducer {
    /// Waits for free capacity; a full queue back-pressures the caller instead of
    /// dropping records.
    pub async fn enqueue(&self, item: QueuedRecord) -> Result<(), QueueError> {
        self.sender
            .send(item)
            .await
            .map_err(|e| QueueError::Closed(Box::new(e.0)))?;
        metrics::gauge!(QUEUE_DEPTH_GAUGE).set(self.len() as f64);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct QueueDrain {
    receiver: mpsc::Receiver<QueuedRecord>,
}

impl QueueDrain {
    /// Takes up to `max` queued records without waiting, in insertion order.
    pub fn drain(&mut self, max: usize) -> Vec<QueuedRecord> {
        let mut drained = Vec::with_capacity(max.min(self.receiver.len()));
        while drained.len() < max {
            match self.receiver.try_recv() {
                Ok(item) => drained.push(item),
                Err(_) => break,
            }
        }
        metrics::gauge!(QUEUE_DEPTH_GAUGE).set(self.receiver.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
