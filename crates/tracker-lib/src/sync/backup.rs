//! Best-effort mirror of the whole buffer to the backup sink
//!
//! Every mirror post carries all buffered records, delivered and pending, so
//! each payload is a complete snapshot. The mirror never touches the
//! pipeline's backoff or online state.

use super::transport::{BackupEnvelope, Transport};
use crate::auth::CredentialProvider;
use crate::config::BackupFormat;
use crate::error::DeliveryError;
use crate::models::Record;
use crate::observability::{PipelineMetrics, StructuredLogger};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct BackupMirror {
    format: BackupFormat,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl BackupMirror {
    pub fn new(
        format: BackupFormat,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            format,
            transport,
            credentials,
            metrics: PipelineMetrics::new(),
            logger,
        }
    }

    pub fn format(&self) -> BackupFormat {
        self.format
    }

    /// Serialize records in the configured backup format
    pub fn render(&self, records: &[Arc<dyn Record>]) -> String {
        match self.format {
            BackupFormat::Json => render_json_lines(records),
            BackupFormat::Csv => render_csv(records),
        }
    }

    /// Post a snapshot of `records`, refreshing and retrying once if the
    /// sink rejects the credential
    pub async fn mirror(&self, records: &[Arc<dyn Record>]) -> Result<(), DeliveryError> {
        let envelope = BackupEnvelope::new(self.render(records), self.format.content_type());

        let outcome = match self.post(&envelope).await {
            Err(err) if err.is_authorization() => match self.credentials.refresh().await {
                Ok(true) => {
                    self.metrics.inc_token_refreshes();
                    self.post(&envelope).await
                }
                Ok(false) => Err(err),
                Err(refresh_err) => {
                    debug!(error = %refresh_err, "Refresh after backup rejection failed");
                    Err(err)
                }
            },
            other => other,
        };

        self.metrics.record_backup(outcome.is_ok());
        let error = outcome.as_ref().err().map(|e| e.to_string());
        self.logger
            .log_backup(records.len(), self.format.as_str(), error.as_deref());
        outcome
    }

    async fn post(&self, envelope: &BackupEnvelope) -> Result<(), DeliveryError> {
        let auth = self.credentials.current_auth_header().await?;
        self.transport.send_backup(envelope, auth.as_deref()).await
    }
}

/// One structured statement per line
pub fn render_json_lines(records: &[Arc<dyn Record>]) -> String {
    records
        .iter()
        .map(|record| record.to_statement().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Header row plus one row per record.
///
/// Columns are the union of every record's fields in first-seen order; a
/// record lacking a column gets an empty cell.
pub fn render_csv(records: &[Arc<dyn Record>]) -> String {
    if records.is_empty() {
        return String::new();
    }

    let rows: Vec<Vec<(String, String)>> = records.iter().map(|r| r.csv_fields()).collect();

    let mut columns: Vec<&str> = Vec::new();
    let mut known: HashSet<&str> = HashSet::new();
    for row in &rows {
        for (column, _) in row {
            if known.insert(column.as_str()) {
                columns.push(column.as_str());
            }
        }
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(
        columns
            .iter()
            .map(|c| escape_csv(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in &rows {
        let cells: HashMap<&str, &str> = row
            .iter()
            .map(|(column, value)| (column.as_str(), value.as_str()))
            .collect();
        lines.push(
            columns
                .iter()
                .map(|c| cells.get(c).map(|v| escape_csv(v)).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    lines.join("\n")
}

fn escape_csv(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}
