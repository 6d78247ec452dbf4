//! HTTP submission to the primary collector and the backup sink
//!
//! The pipeline depends on the [`Transport`] trait only; [`HttpTransport`]
//! is the production implementation over reqwest. No request timeout is set:
//! a stuck request holds the send gate until it resolves.

use crate::config::BackupConfig;
use crate::error::DeliveryError;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

/// Statement API version announced on primary requests
pub const XAPI_VERSION: &str = "1.0.3";
const XAPI_VERSION_HEADER: &str = "X-Experience-API-Version";

/// Body of a backup post
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEnvelope {
    pub tofile: bool,
    /// All buffered records serialized and joined
    pub result: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

impl BackupEnvelope {
    pub fn new(result: String, content_type: &str) -> Self {
        Self {
            tofile: true,
            result,
            content_type: content_type.to_string(),
        }
    }
}

/// Outbound submission capability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit one batch; returns the identifiers the collector accepted
    async fn send_statements(
        &self,
        statements: Vec<Value>,
        auth: Option<&str>,
    ) -> Result<Vec<String>, DeliveryError>;

    /// Post a backup payload to the backup sink
    async fn send_backup(
        &self,
        envelope: &BackupEnvelope,
        auth: Option<&str>,
    ) -> Result<(), DeliveryError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    backup: Option<BackupConfig>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, endpoint: Url, backup: Option<BackupConfig>) -> Self {
        Self {
            client,
            endpoint,
            backup,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DeliveryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_statements(
        &self,
        statements: Vec<Value>,
        auth: Option<&str>,
    ) -> Result<Vec<String>, DeliveryError> {
        let count = statements.len();
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(XAPI_VERSION_HEADER, XAPI_VERSION)
            .json(&json!({ "statements": statements }));
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = Self::check(request.send().await?).await?;
        let body = response.text().await?;
        debug!(statements = count, "Collector accepted batch");

        // Collectors that answer without an id list still accepted the batch
        Ok(serde_json::from_str::<Vec<String>>(&body).unwrap_or_default())
    }

    async fn send_backup(
        &self,
        envelope: &BackupEnvelope,
        auth: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let backup = self.backup.as_ref().ok_or_else(|| DeliveryError::Transport {
            status: None,
            message: "no backup sink configured".to_string(),
        })?;

        let mut request = self
            .client
            .post(backup.endpoint.clone())
            .query(&backup.query)
            .json(envelope);
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }
        for (name, value) in &backup.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        Self::check(request.send().await?).await?;
        Ok(())
    }
}
