use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::Sink;

/// Logs what would have been uploaded; nothing else.
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        path: &Path,
        blob_name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat file: {path:?}"))?
            .len();
        let size_mib = size / (1024 * 1024);

        info!(
            sink = %self.name,
            "{} ({size_mib} MiB), blob name: {blob_name}, metadata: {metadata:?}",
            path.display()
        );
        Ok(blob_name.to_string())
    }
}
