pub mod kafka;

pub use kafka::{KafkaAcknowledger, KafkaSource, KafkaSourceConfig, RebalanceContext};
