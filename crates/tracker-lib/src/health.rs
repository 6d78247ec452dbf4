//! Health tracking for the delivery pipeline
//!
//! The pipeline reports on three collaborators: the primary sink, the backup
//! sink when one is configured, and the credential. Each keeps its last
//! reported state and how many problem reports arrived in a row, so an
//! embedding application can surface pipeline health without reading logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A collaborator whose health the pipeline reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    PrimarySink,
    BackupSink,
    Credentials,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::PrimarySink => "primary_sink",
            Component::BackupSink => "backup_sink",
            Component::Credentials => "credentials",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Retrying or mirroring failed; statements are still buffered safely
    Degraded,
    /// Needs caller action, such as a fresh login
    Unhealthy,
}

/// Last report for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Problem reports since the last healthy one
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn initial() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ComponentStatus::Healthy
    }
}

/// Point-in-time view of every tracked component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

impl HealthResponse {
    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.get(&component)
    }
}

/// Shared record of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<Component, ComponentHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a component as healthy. Already tracked components
    /// keep their state.
    pub async fn track(&self, component: Component) {
        self.components
            .write()
            .await
            .entry(component)
            .or_insert_with(ComponentHealth::initial);
    }

    /// Record a new state. Reports for untracked components are dropped.
    pub async fn report(
        &self,
        component: Component,
        status: ComponentStatus,
        message: Option<String>,
    ) {
        let mut components = self.components.write().await;
        let Some(entry) = components.get_mut(&component) else {
            debug!(component = %component, "Health report for untracked component ignored");
            return;
        };

        entry.consecutive_failures = match status {
            ComponentStatus::Healthy => 0,
            _ => entry.consecutive_failures.saturating_add(1),
        };
        entry.status = status;
        entry.message = message;
        entry.updated_at = Utc::now();
    }

    pub async fn healthy(&self, component: Component) {
        self.report(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn degraded(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn unhealthy(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn snapshot(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }
}
