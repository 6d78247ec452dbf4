//! Statement delivery to the primary collector and backup sink
//!
//! This module provides:
//! - Append-only delivery queue with a confirmed-delivery cursor
//! - Exponential retry backoff and a single-slot retry timer
//! - HTTP transport for batches and backup payloads
//! - Best-effort backup mirroring in JSON-lines or CSV
//! - The pipeline facade tying them together

mod backoff;
mod backup;
mod pipeline;
mod queue;
mod scheduler;
mod transport;


pub use backoff::Backoff;
pub use backup::{render_csv, render_json_lines, BackupMirror};
pub use pipeline::{EnqueueReceipt, FlushReport, Pipeline, PipelineStats};
pub use queue::{Batch, DeliveryQueue};
pub use scheduler::RetryScheduler;
pub use transport::{BackupEnvelope, HttpTransport, Transport, XAPI_VERSION};
