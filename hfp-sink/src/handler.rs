use std::sync::Arc;

use tracing::{debug, warn};

use crate::ack::{Acknowledger, MessageHandle};
use crate::event::{HfpData, ParseError, Record};
use crate::health::ActivityTracker;
use crate::metrics_consts::{PARSE_FAILURES_COUNTER, RECORDS_ENQUEUED_COUNTER};
use crate::queue::{QueueError, QueueProducer, QueuedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Enqueued,
    /// Unparseable; already acknowledged so it is not redelivered
    Rejected,
}

/// Turns raw messages into queued records.
pub struct MessageHandler {
    queue: QueueProducer,
    acknowledger: Arc<dyn Acknowledger>,
    activity: Arc<ActivityTracker>,
}

impl MessageHandler {
    pub fn new(
        queue: QueueProducer,
        acknowledger: Arc<dyn Acknowledger>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            queue,
            acknowledger,
            activity,
        }
    }

    /// Decodes a JSON message body. Fails only when the queue is gone.
    pub async fn handle(
        &self,
        payload: Option<&[u8]>,
        handle: MessageHandle,
    ) -> Result<HandleOutcome, QueueError> {
        let Some(payload) = payload else {
            return Ok(self.reject(handle, "empty", "Received message without payload"));
        };
        match HfpData::from_json(payload) {
            Ok(data) => self.handle_data(&data, handle).await,
            Err(e) => Ok(self.reject(handle, "decode", &ParseError::from(e).to_string())),
        }
    }

    pub async fn handle_data(
        &self,
        data: &HfpData,
        handle: MessageHandle,
    ) -> Result<HandleOutcome, QueueError> {
        let record = match Record::parse(data) {
            Ok(record) => record,
            Err(e) => {
                let reason = match e {
                    ParseError::Decode(_) => "decode",
                    ParseError::MissingEventType | ParseError::UnknownEventType(_) => "classify",
                    _ => "parse",
                };
                return Ok(self.reject(handle, reason, &e.to_string()));
            }
        };

        self.queue.enqueue(QueuedRecord { record, handle }).await?;
        metrics::counter!(RECORDS_ENQUEUED_COUNTER).increment(1);
        self.activity.record_handled();
        Ok(HandleOutcome::Enqueued)
    }

    fn reject(&self, handle: MessageHandle, reason: &'static str, detail: &str) -> HandleOutcome {
        warn!(message = %handle, reason, "Failed to handle message: {detail}");
        metrics::counter!(PARSE_FAILURES_COUNTER, "reason" => reason).increment(1);
        if let Err(e) = self.acknowledger.acknowledge(handle) {
            debug!(message = %handle, error = %e, "Acknowledging rejected message failed");
        }
        HandleOutcome::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ingestion_queue;
    use crate::test_utils::RecordingAcknowledger;

    const VALID: &[u8] = br#"{
        "topic": {"receivedAt": 1609480800000, "eventType": "VP", "journeyType": "journey",
                  "uniqueVehicleId": "1/1"},
        "payload": {"tst": "2021-01-01T08:00:00+02:00", "oday": "2021-01-01"}
    }"#;

    fn handler() -> (MessageHandler, crate::queue::QueueDrain, Arc<RecordingAcknowledger>, Arc<ActivityTracker>) {
        let (producer, drain) = ingestion_queue(10);
        let acks = Arc::new(RecordingAcknowledger::default());
        let activity = Arc::new(ActivityTracker::new());
        (
            MessageHandler::new(producer, acks.clone(), activity.clone()),
            drain,
            acks,
            activity,
        )
    }

    #[tokio::test]
    async fn enqueues_valid_messages_without_acking() {
        let (handler, mut drain, acks, activity) = handler();
        let outcome = handler.handle(Some(VALID), MessageHandle::new(0, 1)).await.unwrap();

        assert_eq!(outcome, HandleOutcome::Enqueued);
        let queued = drain.drain(10);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].handle, MessageHandle::new(0, 1));
        assert_eq!(queued[0].record.event_type.as_deref(), Some("VP"));
        assert!(acks.acked().is_empty());
        assert!(activity.since_last_handled().is_some());
    }

    #[tokio::test]
    async fn acknowledges_unparseable_messages_immediately() {
        let (handler, mut drain, acks, activity) = handler();

        let unknown = String::from_utf8_lossy(VALID).replace("\"VP\"", "\"XYZ\"");
        let inputs: Vec<Option<&[u8]>> = vec![None, Some(b"garbage"), Some(unknown.as_bytes())];
        for (offset, payload) in inputs.into_iter().enumerate() {
            let handle = MessageHandle::new(0, offset as i64);
            assert_eq!(
                handler.handle(payload, handle).await.unwrap(),
                HandleOutcome::Rejected
            );
        }

        assert!(drain.drain(10).is_empty());
        assert_eq!(acks.acked().len(), 3);
        assert!(activity.since_last_handled().is_none());
    }

    #[tokio::test]
    async fn failed_acknowledgement_still_rejects() {
        let (handler, mut drain, acks, _) = handler();
        acks.fail_next(1);

        let outcome = handler.handle(Some(b"garbage"), MessageHandle::new(0, 9)).await.unwrap();

        assert_eq!(outcome, HandleOutcome::Rejected);
        assert!(acks.acked().is_empty());
        assert!(drain.drain(10).is_empty());
    }
}
