//! Statement tracking library for learning-activity collectors
//!
//! This crate provides the core functionality for:
//! - Building activity statements for a fixed actor
//! - Buffering and batched delivery to a primary collector
//! - Retry with exponential backoff and online/offline gating
//! - Bearer, basic and OAuth2 credentials with single-flight refresh
//! - Best-effort backup mirroring
//! - Health checks and observability

pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod sync;

pub use auth::{Anonymous, CredentialKind, CredentialProvider, OAuth2Credentials, StaticToken};
pub use config::{AuthConfig, BackupFormat, PipelineConfig, PipelineConfigBuilder};
pub use error::{AuthError, ConfigError, DeliveryError, FlushError, PipelineError};
pub use health::{Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse};
pub use models::*;
pub use observability::{init_tracing, PipelineMetrics, StructuredLogger};
pub use sync::{EnqueueReceipt, FlushReport, Pipeline, PipelineStats};
