use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use serde_json::json;

use hfp_sink::config::Config;
use hfp_sink::event::schema::{header, BASE_COLUMNS};
use hfp_sink::handler::{HandleOutcome, MessageHandler};
use hfp_sink::health::ActivityTracker;
use hfp_sink::service::{build_engine, Engine};
use hfp_sink::test_utils::{read_bucket_file, MemorySink, RecordingAcknowledger};
use hfp_sink::MessageHandle;

// 2021-01-01T08:00:00+02:00
const BASE_MILLIS: i64 = 1_609_480_800_000;

struct Harness {
    dir: tempfile::TempDir,
    engine: Engine,
    handler: MessageHandler,
    public: Arc<MemorySink>,
    private: Arc<MemorySink>,
    acks: Arc<RecordingAcknowledger>,
}

impl Harness {
    fn new(public: MemorySink) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<String, String> = [
            ("SINK_TYPE", "log"),
            ("DATA_DIRECTORY", dir.path().to_str().unwrap()),
            ("UPLOAD_IDLE_THRESHOLD_SECS", "0"),
            ("WRITER_THREADS", "2"),
            ("ZSTD_COMPRESSION_LEVEL", "3"),
            ("QUEUE_CAPACITY", "1000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = Config::init_from_hashmap(&env).unwrap();
        config.validate().unwrap();

        let public = Arc::new(public);
        let private = Arc::new(MemorySink::new("private"));
        let acks = Arc::new(RecordingAcknowledger::default());
        let engine = build_engine(&config, public.clone(), private.clone(), acks.clone()).unwrap();
        let handler = MessageHandler::new(
            engine.producer.clone(),
            acks.clone(),
            Arc::new(ActivityTracker::new()),
        );

        Self {
            dir,
            engine,
            handler,
            public,
            private,
            acks,
        }
    }

    async fn send(&self, offset: i64, message: serde_json::Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        let outcome = self
            .handler
            .handle(Some(&payload), MessageHandle::new(0, offset))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Enqueued);
    }

    async fn write_and_wait(&mut self) {
        self.engine.pipeline.run_write_cycle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn bucket_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn position_message(second: i64, journey_type: &str, oday: &str) -> serde_json::Value {
    json!({
        "topic": {
            "receivedAt": BASE_MILLIS + second * 1000,
            "topicPrefix": "/hfp/",
            "topicVersion": "v2",
            "journeyType": journey_type,
            "temporalType": "ongoing",
            "eventType": "VP",
            "transportMode": "bus",
            "operatorId": 22,
            "vehicleNumber": 1,
            "uniqueVehicleId": "1/1",
        },
        "payload": {
            "tst": format!("2021-01-01T08:00:{second:02}+02:00"),
            "desi": "550",
            "dir": "1",
            "oper": 22,
            "veh": 1,
            "tsi": BASE_MILLIS / 1000 + second,
            "spd": 8.2,
            "hdg": 90,
            "lat": 60.1699,
            "long": 24.9384,
            "oday": oday,
            "route": "2550",
            "start": "07:55",
        }
    })
}

#[tokio::test]
async fn ten_position_updates_form_one_public_file() {
    let mut harness = Harness::new(MemorySink::new("public"));
    for second in 0..10 {
        harness
            .send(second, position_message(second, "journey", "2021-01-01"))
            .await;
    }

    let stats = harness.engine.pipeline.run_write_cycle().await;
    assert_eq!(stats.records, 10);
    assert_eq!(stats.written, 10);

    let snapshot = harness.engine.registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    let (id, bucket) = &snapshot[0];
    assert_eq!(id.blob_name(), "2021-01-01T06-1_utc_VP.csv.zst");
    assert!(!id.private);
    assert!(!id.invalid);

    bucket.lock().await.writer.close().unwrap();
    let rows = read_bucket_file(&harness.dir.path().join(id.blob_name()));
    assert_eq!(rows.len(), 11);
    assert_eq!(rows[0], header(BASE_COLUMNS));
    assert!(rows[1..].iter().all(|row| row.len() == BASE_COLUMNS.len()));
}

#[tokio::test]
async fn duplicate_messages_are_written_once_and_acked_after_upload() {
    let mut harness = Harness::new(MemorySink::new("public"));
    harness.send(0, position_message(0, "journey", "2021-01-01")).await;
    harness.send(1, position_message(0, "journey", "2021-01-01")).await;
    harness.send(2, position_message(1, "journey", "2021-01-01")).await;

    harness.write_and_wait().await;
    assert!(harness.acks.acked().is_empty());

    let stats = harness.engine.pipeline.run_upload_cycle().await;
    assert_eq!(stats.uploaded, 1);

    let uploads = harness.public.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].rows.len(), 3);
    assert_eq!(uploads[0].metadata["row_count"], "2");
    assert_eq!(
        harness.acks.acked(),
        (0..3).map(|o| MessageHandle::new(0, o)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn non_revenue_records_are_private() {
    let mut harness = Harness::new(MemorySink::new("public"));
    harness.send(0, position_message(0, "deadrun", "2021-01-01")).await;
    harness.send(1, position_message(1, "journey", "2021-01-01")).await;

    harness.write_and_wait().await;
    harness.engine.pipeline.run_upload_cycle().await;

    let private = harness.private.uploads();
    assert_eq!(private.len(), 1);
    assert_eq!(private[0].blob_name, "2021-01-01T06-1_utc_VP_private.csv.zst");
    let public = harness.public.uploads();
    assert_eq!(public.len(), 1);
    assert_eq!(public[0].blob_name, "2021-01-01T06-1_utc_VP.csv.zst");
}

#[tokio::test]
async fn implausible_operating_days_go_to_invalid_bucket() {
    let mut harness = Harness::new(MemorySink::new("public"));
    harness.send(0, position_message(0, "journey", "2020-12-25")).await;
    harness.send(1, position_message(1, "journey", "2021-01-02")).await;

    harness.engine.pipeline.run_write_cycle().await;

    assert_eq!(
        harness.bucket_files(),
        vec![
            "2021-01-01T06-1_utc_VP.csv.zst".to_string(),
            "2021-01-01T06-1_utc_VP_invalid.csv.zst".to_string(),
        ]
    );
}

#[tokio::test]
async fn failed_upload_is_retried_next_cycle() {
    let mut harness = Harness::new(MemorySink::failing("public", 1));
    for second in 0..5 {
        harness
            .send(second, position_message(second, "journey", "2021-01-01"))
            .await;
    }
    harness.write_and_wait().await;
    let file = harness.dir.path().join("2021-01-01T06-1_utc_VP.csv.zst");

    let first = harness.engine.pipeline.run_upload_cycle().await;
    assert_eq!(first.failed, 1);
    assert_eq!(harness.engine.registry.len(), 1);
    assert!(file.exists());
    assert!(harness.acks.acked().is_empty());

    let second = harness.engine.pipeline.run_upload_cycle().await;
    assert_eq!(second.uploaded, 1);
    assert!(harness.engine.registry.is_empty());
    assert!(!file.exists());
    assert_eq!(harness.public.attempts(), 2);
    assert_eq!(
        harness.acks.acked(),
        (0..5).map(|o| MessageHandle::new(0, o)).collect::<Vec<_>>()
    );

    let third = harness.engine.pipeline.run_upload_cycle().await;
    assert_eq!(third.open, 0);
    assert_eq!(harness.acks.acked().len(), 5);
}

#[tokio::test]
async fn messages_arriving_before_a_retry_are_uploaded_with_it() {
    let mut harness = Harness::new(MemorySink::failing("public", 1));
    for second in 0..5 {
        harness
            .send(second, position_message(second, "journey", "2021-01-01"))
            .await;
    }
    harness.write_and_wait().await;

    let first = harness.engine.pipeline.run_upload_cycle().await;
    assert_eq!(first.failed, 1);

    harness.send(5, position_message(5, "journey", "2021-01-01")).await;
    harness.send(6, position_message(6, "journey", "2021-01-01")).await;
    let stats = harness.engine.pipeline.run_write_cycle().await;
    assert_eq!(stats.written, 2);
    assert_eq!(stats.faults, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = harness.engine.pipeline.run_upload_cycle().await;
    assert_eq!(second.uploaded, 1);
    assert!(harness.engine.registry.is_empty());

    let uploads = harness.public.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].rows.len(), 8);
    assert_eq!(uploads[0].metadata["row_count"], "7");
    assert_eq!(
        harness.acks.acked(),
        (0..7).map(|o| MessageHandle::new(0, o)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn unparseable_messages_are_acked_without_buffering() {
    let mut harness = Harness::new(MemorySink::new("public"));
    let outcome = harness
        .handler
        .handle(Some(b"{not json"), MessageHandle::new(3, 7))
        .await
        .unwrap();
    assert_eq!(outcome, HandleOutcome::Rejected);

    let stats = harness.engine.pipeline.run_write_cycle().await;
    assert_eq!(stats.records, 0);
    assert!(harness.engine.registry.is_empty());
    assert_eq!(harness.acks.acked(), vec![MessageHandle::new(3, 7)]);
}
