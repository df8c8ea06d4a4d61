//! HFP sink service.
//!
//! Buffers a stream of HFP (high-frequency positioning) events into time-sliced,
//! zstd-compressed CSV files per event category, uploads closed files to blob storage
//! and only then acknowledges the source messages.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use `{e:#}`
//! (inline) or `error = ?e` (structured) so the root cause is visible. When constructing
//! errors use `.context()` / `.with_context()` so the original error stays the source.

pub mod ack;
pub mod batch_writer;
pub mod bucket;
pub mod config;
pub mod dedup;
pub mod event;
pub mod handler;
pub mod health;
pub mod metrics_consts;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod service;
pub mod sink;
pub mod source;
pub mod test_utils;
pub mod uploader;
pub mod validator;

pub use ack::{Acknowledger, MessageHandle};
pub use event::{EventCategory, Record};
pub use pipeline::Pipeline;
pub use sink::Sink;
