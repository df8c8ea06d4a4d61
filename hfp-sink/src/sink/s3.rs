use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use super::Sink;

#[derive(Debug, Clone)]
pub struct S3SinkConfig {
    pub bucket: String,
    pub key_prefix: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub timeout: Duration,
}

pub struct S3Sink {
    name: String,
    client: Client,
    config: S3SinkConfig,
}

impl S3Sink {
    pub async fn new(name: impl Into<String>, config: S3SinkConfig) -> Result<Self> {
        let client = create_s3_client(&config).await;

        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .with_context(|| {
                format!(
                    "S3 bucket validation failed for '{}' in region '{}'. Check credentials and bucket access.",
                    config.bucket, config.region
                )
            })?;
        info!(
            "S3 bucket '{}' validated successfully in region '{}'",
            config.bucket, config.region
        );

        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    fn key(&self, blob_name: &str) -> String {
        object_key(&self.config.key_prefix, blob_name)
    }

    async fn exists(&self, key: &str) -> bool {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found());
                if !not_found {
                    debug!(key, error = %e, "Could not check for an existing object");
                }
                false
            }
        }
    }
}

fn object_key(prefix: &str, blob_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        blob_name.to_string()
    } else {
        format!("{prefix}/{blob_name}")
    }
}

async fn create_s3_client(config: &S3SinkConfig) -> Client {
    let timeout_config = TimeoutConfig::builder()
        .operation_timeout(config.timeout)
        .build();

    let base = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&base)
        .timeout_config(timeout_config)
        .retry_config(RetryConfig::adaptive())
        .force_path_style(config.force_path_style);

    if let Some(ref endpoint) = config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    Client::from_conf(builder.build())
}

#[async_trait]
impl Sink for S3Sink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        path: &Path,
        blob_name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let key = self.key(blob_name);
        info!("Uploading {path:?} to s3://{}/{key}", self.config.bucket);

        if self.exists(&key).await {
            warn!(
                "Object s3://{}/{key} already exists and it will be overwritten",
                self.config.bucket
            );
        }

        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to read file: {path:?}"))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .content_type("application/zstd")
            .set_metadata(Some(metadata.clone()))
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3 key: {key}"))?;

        info!("Uploaded {path:?} to s3://{}/{key}", self.config.bucket);
        Ok(key)
    }
}
