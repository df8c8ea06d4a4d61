use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ack::{AckError, Acknowledger, MessageHandle, PendingOffsets};
use crate::handler::MessageHandler;
use crate::health::ActivityTracker;
use crate::metrics_consts::{OFFSETS_STORED_COUNTER, PARTITIONS_REVOKED_COUNTER};

#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    pub hosts: String,
    pub group: String,
    pub topic: String,
    pub offset_reset: String,
    pub tls: bool,
    pub auto_commit_interval_ms: u32,
}

/// Drops the pending offsets of revoked partitions. Their buffered messages are
/// redelivered to the new owner, and acknowledging them here later is a no-op.
pub struct RebalanceContext {
    offsets: Arc<PendingOffsets>,
}

impl RebalanceContext {
    pub fn new(offsets: Arc<PendingOffsets>) -> Self {
        Self { offsets }
    }

    fn revoke(&self, partitions: &TopicPartitionList) {
        // cooperative-sticky sends empty revokes on every membership change
        if partitions.count() == 0 {
            debug!("Skipping empty revoke rebalance");
            return;
        }

        info!("Revoking {} partitions", partitions.count());
        for element in partitions.elements() {
            self.offsets.forget_partition(element.partition());
        }
        metrics::counter!(PARTITIONS_REVOKED_COUNTER).increment(partitions.count() as u64);
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.revoke(partitions),
            Rebalance::Assign(partitions) => {
                info!("Pre-rebalance assign event for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }
}

/// Consumes HFP messages from one topic. Offsets are only stored (and then
/// auto-committed) through [`KafkaAcknowledger`], once their data is uploaded.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    topic: String,
    offsets: Arc<PendingOffsets>,
}

impl KafkaSource {
    pub fn new(config: &KafkaSourceConfig, activity: Arc<ActivityTracker>) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.group)
            .set("auto.offset.reset", &config.offset_reset)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false");

        if config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let offsets = Arc::new(PendingOffsets::new(activity));
        let consumer: StreamConsumer<RebalanceContext> = client_config
            .create_with_context(RebalanceContext::new(offsets.clone()))
            .context("Failed to create Kafka consumer")?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .with_context(|| format!("Failed to subscribe to topic {}", config.topic))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
            offsets,
        })
    }

    pub fn acknowledger(&self) -> KafkaAcknowledger {
        KafkaAcknowledger {
            consumer: self.consumer.clone(),
            topic: self.topic.clone(),
            offsets: self.offsets.clone(),
        }
    }

    /// Feeds messages into `handler` until cancelled or the queue closes.
    pub async fn run(&self, handler: &MessageHandler, shutdown: CancellationToken) {
        info!(topic = %self.topic, "Started handling messages");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.consumer.recv() => message,
            };

            let (handle, payload) = match message {
                Ok(message) => (
                    MessageHandle::new(message.partition(), message.offset()),
                    message.payload().map(<[u8]>::to_vec),
                ),
                Err(e) => {
                    error!(error = %e, "Kafka receive error");
                    continue;
                }
            };

            self.offsets.register(handle);

            if let Err(e) = handler.handle(payload.as_deref(), handle).await {
                warn!(error = %e, "Ingestion queue closed, stopping consumer");
                break;
            }
        }
        info!("Stopped handling messages");
    }
}

/// Stores the committable offset of a partition whenever an acknowledgement moves it.
#[derive(Clone)]
pub struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    topic: String,
    offsets: Arc<PendingOffsets>,
}

impl Acknowledger for KafkaAcknowledger {
    fn acknowledge(&self, handle: MessageHandle) -> Result<(), AckError> {
        let next = self.offsets.acknowledge(handle)?;

        let Some(next) = next else {
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, handle.partition, Offset::Offset(next))
            .and_then(|()| self.consumer.store_offsets(&tpl))
            .map_err(|e| AckError::Store {
                handle,
                reason: e.to_string(),
            })?;

        metrics::counter!(OFFSETS_STORED_COUNTER, "partition" => handle.partition.to_string())
            .increment(1);
        Ok(())
    }
}
