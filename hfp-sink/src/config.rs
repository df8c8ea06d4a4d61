use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use envconfig::Envconfig;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("TIME_SLOT_MINUTES must divide an hour evenly, got {0}")]
    SlotWidth(u32),
    #[error("unknown SINK_TYPE {0:?}, expected \"s3\" or \"log\"")]
    UnknownSink(String),
    #[error("{0} is required when SINK_TYPE is s3")]
    MissingBucket(&'static str),
    #[error("unknown timezone {0:?}")]
    Timezone(String),
    #[error("ZSTD_COMPRESSION_LEVEL must be within 1..=22, got {0}")]
    CompressionLevel(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkType {
    S3,
    Log,
}

impl FromStr for SinkType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(SinkType::S3),
            "log" | "test" => Ok(SinkType::Log),
            other => Err(ConfigError::UnknownSink(other.to_string())),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "hfp-sink")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "hfp")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "5000")]
    pub kafka_auto_commit_interval_ms: u32,

    // Local buffering
    #[envconfig(default = "hfp")]
    pub data_directory: String,

    #[envconfig(default = "19")]
    pub zstd_compression_level: i32,

    #[envconfig(default = "750000")]
    pub queue_capacity: usize,

    #[envconfig(default = "15")] // seconds
    pub write_interval_secs: u64,

    #[envconfig(default = "900")] // 15 minutes in seconds
    pub upload_interval_secs: u64,

    #[envconfig(default = "900")] // 15 minutes in seconds
    pub upload_idle_threshold_secs: u64,

    #[envconfig(default = "15")]
    pub time_slot_minutes: u32,

    #[envconfig(default = "2")]
    pub empty_upload_warning_threshold: u32,

    // 0 means 1.5x the available parallelism
    #[envconfig(default = "0")]
    pub writer_threads: usize,

    // Sinks
    #[envconfig(default = "s3")]
    pub sink_type: String,

    pub s3_public_bucket: Option<String>,

    pub s3_private_bucket: Option<String>,

    #[envconfig(default = "")]
    pub s3_key_prefix: String,

    pub s3_endpoint: Option<String>,

    #[envconfig(default = "false")]
    pub s3_force_path_style: bool,

    #[envconfig(default = "eu-north-1")]
    pub aws_region: String,

    #[envconfig(default = "300")] // 5 minutes in seconds
    pub s3_timeout_secs: u64,

    // Validators
    #[envconfig(default = "true")]
    pub validator_tst_enabled: bool,

    #[envconfig(default = "3600")]
    pub validator_tst_max_past_secs: i64,

    #[envconfig(default = "60")]
    pub validator_tst_max_future_secs: i64,

    #[envconfig(default = "true")]
    pub validator_oday_enabled: bool,

    #[envconfig(default = "1")]
    pub validator_oday_max_past_days: i64,

    #[envconfig(default = "1")]
    pub validator_oday_max_future_days: i64,

    #[envconfig(default = "Europe/Helsinki")]
    pub validator_oday_timezone: String,

    // Health thresholds
    #[envconfig(default = "300")] // 5 minutes in seconds
    pub health_max_since_handled_secs: u64,

    // Oldest unacknowledged message; spans the idle threshold plus an upload interval
    #[envconfig(default = "3600")] // 1 hour in seconds
    pub health_max_pending_age_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("QUEUE_CAPACITY"));
        }
        if self.write_interval_secs == 0 {
            return Err(ConfigError::Zero("WRITE_INTERVAL_SECS"));
        }
        if self.upload_interval_secs == 0 {
            return Err(ConfigError::Zero("UPLOAD_INTERVAL_SECS"));
        }
        if self.time_slot_minutes == 0 || 60 % self.time_slot_minutes != 0 {
            return Err(ConfigError::SlotWidth(self.time_slot_minutes));
        }
        if !(1..=22).contains(&self.zstd_compression_level) {
            return Err(ConfigError::CompressionLevel(self.zstd_compression_level));
        }
        if self.sink()? == SinkType::S3 {
            if self.s3_public_bucket.as_deref().unwrap_or_default().is_empty() {
                return Err(ConfigError::MissingBucket("S3_PUBLIC_BUCKET"));
            }
            if self.s3_private_bucket.as_deref().unwrap_or_default().is_empty() {
                return Err(ConfigError::MissingBucket("S3_PRIVATE_BUCKET"));
            }
        }
        self.oday_timezone()?;
        Ok(())
    }

    pub fn sink(&self) -> Result<SinkType, ConfigError> {
        self.sink_type.parse()
    }

    pub fn oday_timezone(&self) -> Result<Tz, ConfigError> {
        self.validator_oday_timezone
            .parse()
            .map_err(|_| ConfigError::Timezone(self.validator_oday_timezone.clone()))
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_secs(self.write_interval_secs)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn upload_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.upload_idle_threshold_secs)
    }

    pub fn s3_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_timeout_secs)
    }

    pub fn health_max_since_handled(&self) -> Duration {
        Duration::from_secs(self.health_max_since_handled_secs)
    }

    pub fn health_max_pending_age(&self) -> Duration {
        Duration::from_secs(self.health_max_pending_age_secs)
    }

    /// Worker count for the write cycle; `0` scales with the machine.
    pub fn writer_threads(&self) -> usize {
        if self.writer_threads > 0 {
            return self.writer_threads;
        }
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        (cpus * 3).div_ceil(2)
    }
}
