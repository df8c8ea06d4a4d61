use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

pub mod log;
pub mod s3;

pub use self::log::LogSink;
pub use self::s3::S3Sink;

/// Durable upload target for closed bucket files.
///
/// Uploads are retried under the same name after failures, so overwriting an existing
/// blob must be accepted.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name for logs and metric labels.
    fn name(&self) -> &str;

    /// Uploads the file at `path` as `blob_name` and returns the external name it was
    /// stored under.
    async fn upload(
        &self,
        path: &Path,
        blob_name: &str,
        metadata: &HashMap<String, String>,
    ) -> anyhow::Result<String>;
}
