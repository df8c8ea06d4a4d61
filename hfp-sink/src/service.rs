use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ack::{Acknowledger, TrackedAcknowledger};
use crate::batch_writer::BatchWriter;
use crate::bucket::{BucketFactory, BucketRegistry};
use crate::config::{Config, SinkType};
use crate::handler::MessageHandler;
use crate::health::ActivityTracker;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::queue::{ingestion_queue, QueueProducer};
use crate::sink::s3::S3SinkConfig;
use crate::sink::{LogSink, S3Sink, Sink};
use crate::source::{KafkaSource, KafkaSourceConfig};
use crate::uploader::Uploader;
use crate::validator::{OdayValidator, TimestampValidator, ValidatorSet};

/// Validators enabled by the configuration.
pub fn build_validators(config: &Config) -> Result<ValidatorSet> {
    let mut validators = ValidatorSet::default();
    if config.validator_tst_enabled {
        validators = validators.with(TimestampValidator::new(
            ChronoDuration::seconds(config.validator_tst_max_past_secs),
            ChronoDuration::seconds(config.validator_tst_max_future_secs),
        ));
    }
    if config.validator_oday_enabled {
        validators = validators.with(OdayValidator::new(
            config.oday_timezone()?,
            config.validator_oday_max_past_days,
            config.validator_oday_max_future_days,
        ));
    }
    Ok(validators)
}

/// Public and private sinks, in that order.
pub async fn build_sinks(config: &Config) -> Result<(Arc<dyn Sink>, Arc<dyn Sink>)> {
    match config.sink()? {
        SinkType::Log => Ok((
            Arc::new(LogSink::new("public")),
            Arc::new(LogSink::new("private")),
        )),
        SinkType::S3 => {
            let s3_config = |bucket: &Option<String>| S3SinkConfig {
                bucket: bucket.clone().unwrap_or_default(),
                key_prefix: config.s3_key_prefix.clone(),
                region: config.aws_region.clone(),
                endpoint: config.s3_endpoint.clone(),
                force_path_style: config.s3_force_path_style,
                timeout: config.s3_timeout(),
            };
            let public = S3Sink::new("public", s3_config(&config.s3_public_bucket)).await?;
            let private = S3Sink::new("private", s3_config(&config.s3_private_bucket)).await?;
            Ok((Arc::new(public), Arc::new(private)))
        }
    }
}

/// The buffering engine without a message source: queue producer, pipeline and registry.
pub struct Engine {
    pub producer: QueueProducer,
    pub pipeline: Pipeline,
    pub registry: Arc<BucketRegistry>,
}

pub fn build_engine(
    config: &Config,
    public_sink: Arc<dyn Sink>,
    private_sink: Arc<dyn Sink>,
    acknowledger: Arc<dyn Acknowledger>,
) -> Result<Engine> {
    let factory = BucketFactory::new(
        config.data_dir(),
        config.zstd_compression_level,
        build_validators(config)?,
    )
    .with_slot_minutes(config.time_slot_minutes)
    .with_idle_threshold(config.upload_idle_threshold());
    let registry = Arc::new(BucketRegistry::new(factory));

    let (producer, drain) = ingestion_queue(config.queue_capacity);
    let writer = BatchWriter::new(registry.clone(), config.writer_threads());
    let uploader = Uploader::new(registry.clone(), public_sink, private_sink, acknowledger)
        .with_empty_cycle_warning_threshold(config.empty_upload_warning_threshold);

    let pipeline = Pipeline::new(
        drain,
        writer,
        uploader,
        registry.clone(),
        PipelineConfig {
            write_interval: config.write_interval(),
            upload_interval: config.upload_interval(),
            drain_limit: config.queue_capacity,
        },
    );

    Ok(Engine {
        producer,
        pipeline,
        registry,
    })
}

pub struct HfpSinkService {
    config: Config,
    activity: Arc<ActivityTracker>,
}

impl HfpSinkService {
    pub fn new(config: Config, activity: Arc<ActivityTracker>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        Ok(Self { config, activity })
    }

    /// Consumes until `shutdown` is cancelled, then lets the pipeline finish its last
    /// cycle.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let data_dir = self.config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {data_dir:?}"))?;

        let source_config = KafkaSourceConfig {
            hosts: self.config.kafka_hosts.clone(),
            group: self.config.kafka_consumer_group.clone(),
            topic: self.config.kafka_consumer_topic.clone(),
            offset_reset: self.config.kafka_consumer_offset_reset.clone(),
            tls: self.config.kafka_tls,
            auto_commit_interval_ms: self.config.kafka_auto_commit_interval_ms,
        };
        let source = KafkaSource::new(&source_config, self.activity.clone())?;
        let acknowledger: Arc<dyn Acknowledger> =
            Arc::new(TrackedAcknowledger::new(Arc::new(source.acknowledger())));

        let (public_sink, private_sink) = build_sinks(&self.config).await?;
        let engine = build_engine(&self.config, public_sink, private_sink, acknowledger.clone())?;
        let handler = MessageHandler::new(engine.producer, acknowledger, self.activity.clone());

        let pipeline_task = tokio::spawn(engine.pipeline.run(shutdown.clone()));

        source.run(&handler, shutdown.clone()).await;
        shutdown.cancel();
        drop(handler);

        pipeline_task.await.context("Pipeline task failed")?;
        info!("HFP sink service stopped");
        Ok(())
    }
}
