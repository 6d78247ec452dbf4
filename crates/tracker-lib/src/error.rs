//! Error types for the statement pipeline

use thiserror::Error;

/// Invalid or incomplete pipeline configuration.
///
/// Raised eagerly while building a [`PipelineConfig`](crate::config::PipelineConfig),
/// before any network activity starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field required by the selected flow is absent or empty
    #[error("Missing required configuration field: {0}")]
    MissingField(&'static str),

    /// A field is present but unusable
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// A URL field does not parse as an absolute URL
    #[error("Invalid URL for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    /// OAuth2 grant type other than `password` or `refresh_token`
    #[error("Unsupported OAuth2 grant type: {0}")]
    UnsupportedGrantType(String),

    /// Unknown backup serialization format
    #[error("Unsupported backup format: {0}")]
    UnsupportedBackupFormat(String),

    /// Config file or environment could not be read
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Credential lifecycle errors.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// No credential has been acquired yet, or it was cleared on logout
    #[error("Not logged in")]
    NotLoggedIn,

    /// The token endpoint rejected the exchange
    #[error("Token exchange failed (HTTP {status}): {body}")]
    Exchange { status: u16, body: String },

    /// The token endpoint returned something other than a token
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// The token endpoint could not be reached
    #[error("Token endpoint unreachable: {0}")]
    Network(String),

    /// Another caller's refresh failed while this caller was waiting on it
    #[error("Token refresh failed: {0}")]
    Refresh(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}

/// Outcome of a failed primary or backup submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Collector answered 401 or 403
    #[error("Collector rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Any other non-2xx status or network failure
    #[error("Transport failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport { status: Option<u16>, message: String },

    /// No usable credential was available for the request
    #[error("No credential available: {0}")]
    NoCredential(String),
}

impl DeliveryError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => DeliveryError::Unauthorized { status },
            _ => DeliveryError::Transport {
                status: Some(status),
                message: body.into(),
            },
        }
    }

    /// Returns true when the collector rejected the credential that was sent
    pub fn is_authorization(&self) -> bool {
        matches!(self, DeliveryError::Unauthorized { .. })
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        match err.status().map(|s| s.as_u16()) {
            Some(status @ (401 | 403)) => DeliveryError::Unauthorized { status },
            status => DeliveryError::Transport {
                status,
                message: err.to_string(),
            },
        }
    }
}

impl From<AuthError> for DeliveryError {
    fn from(err: AuthError) -> Self {
        DeliveryError::NoCredential(err.to_string())
    }
}

/// Combined outcome of a failed [`Pipeline::flush`](crate::sync::Pipeline::flush).
#[derive(Error, Debug, Clone)]
pub enum FlushError {
    #[error("Primary delivery failed: {0}")]
    Primary(DeliveryError),

    #[error("Backup mirror failed: {0}")]
    Backup(DeliveryError),

    #[error("Primary delivery failed: {primary}; backup mirror failed: {backup}")]
    Both {
        primary: DeliveryError,
        backup: DeliveryError,
    },
}

impl FlushError {
    /// Build from the two independent outcomes, `None` when both succeeded
    pub fn from_outcomes(
        primary: Option<DeliveryError>,
        backup: Option<DeliveryError>,
    ) -> Option<Self> {
        match (primary, backup) {
            (None, None) => None,
            (Some(primary), None) => Some(FlushError::Primary(primary)),
            (None, Some(backup)) => Some(FlushError::Backup(backup)),
            (Some(primary), Some(backup)) => Some(FlushError::Both { primary, backup }),
        }
    }
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The pipeline was dropped before the awaited event happened
    #[error("Pipeline closed")]
    Closed,
}
