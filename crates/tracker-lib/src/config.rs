//! Pipeline configuration
//!
//! Raw settings are deserialized from a config file and `TRACKER_*`
//! environment variables, then validated once into an immutable
//! [`PipelineConfig`]. Every configuration error surfaces here, before the
//! pipeline makes any network call.

use crate::error::ConfigError;
use crate::models::Actor;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default number of statements per batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default delay before a partial batch is sent
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling for the retry backoff
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Default prefix for non-absolute verb/object identifiers
pub const DEFAULT_URI_PREFIX: &str = "http://example.com/xapi/";

/// Environment variable prefix used by [`PipelineConfig::load`]
pub const ENV_PREFIX: &str = "TRACKER";

/// Serialization used for backup payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// One structured statement per line
    Json,
    /// Flattened rows with a header line
    Csv,
}

impl BackupFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            BackupFormat::Json => "application/json",
            BackupFormat::Csv => "text/csv",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFormat::Json => "json",
            BackupFormat::Csv => "csv",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "json" | "application/json" => Ok(BackupFormat::Json),
            "csv" | "text/csv" => Ok(BackupFormat::Csv),
            other => Err(ConfigError::UnsupportedBackupFormat(other.to_string())),
        }
    }
}

/// Secondary best-effort sink
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub endpoint: Url,
    pub format: BackupFormat,
    /// Extra headers merged into every backup request
    pub headers: BTreeMap<String, String>,
    /// Extra query parameters merged into every backup request
    pub query: BTreeMap<String, String>,
}

/// OAuth2 grant used for initial token acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantType {
    Password {
        username: String,
        password: String,
        login_hint: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
    },
}

/// OAuth2 token endpoint settings
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub token_endpoint: Url,
    /// Where logout revokes the refresh token; local-only logout when absent
    pub revocation_endpoint: Option<Url>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub grant: GrantType,
}

/// How the pipeline authorizes requests
#[derive(Debug, Clone)]
pub enum AuthConfig {
    None,
    Bearer { token: String },
    Basic { username: String, password: String },
    OAuth2(OAuth2Config),
}

/// Validated, immutable pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    endpoint: Url,
    backup: Option<BackupConfig>,
    actor: Actor,
    uri_prefix: String,
    batch_size: usize,
    batch_timeout: Duration,
    max_retry_delay: Duration,
    debug: bool,
    auth: AuthConfig,
}

impl PipelineConfig {
    /// Start building a configuration for the given statements endpoint
    pub fn builder(endpoint: impl Into<String>, actor: Actor) -> PipelineConfigBuilder {
        PipelineConfigBuilder::new(endpoint, actor)
    }

    /// Load from `TRACKER_*` environment variables only
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Self::from_settings(settings.try_deserialize()?)
    }

    /// Load from a config file, overridden by `TRACKER_*` environment variables
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = read_layered(path).map_err(|e| ConfigError::Load(format!("{e:#}")))?;
        Self::from_settings(settings)
    }

    /// Validate raw settings
    pub fn from_settings(settings: PipelineSettings) -> Result<Self, ConfigError> {
        let mut builder = PipelineConfigBuilder::new(
            settings.endpoint,
            Actor::new(settings.actor.name, settings.actor.home_page),
        )
        .uri_prefix(settings.uri_prefix)
        .batch_size(settings.batch_size)
        .batch_timeout(Duration::from_millis(settings.batch_timeout_ms))
        .max_retry_delay(Duration::from_millis(settings.max_retry_delay_ms))
        .debug(settings.debug);

        if let Some(backup) = settings.backup {
            let format = BackupFormat::parse(&backup.format)?;
            builder = builder.backup_with(backup.endpoint, format, backup.headers, backup.query);
        }

        builder = match settings.auth {
            AuthSettings::None => builder,
            AuthSettings::Bearer { token } => builder.bearer_token(token),
            AuthSettings::Basic { username, password } => builder.basic_auth(username, password),
            AuthSettings::OAuth2(oauth) => builder.oauth2_settings(oauth),
        };

        builder.build()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn backup(&self) -> Option<&BackupConfig> {
        self.backup.as_ref()
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn uri_prefix(&self) -> &str {
        &self.uri_prefix
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }
}

fn read_layered(path: &Path) -> anyhow::Result<PipelineSettings> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Builder for [`PipelineConfig`]; `build` performs all validation
pub struct PipelineConfigBuilder {
    endpoint: String,
    actor: Actor,
    backup: Option<(String, BackupFormat, BTreeMap<String, String>, BTreeMap<String, String>)>,
    uri_prefix: String,
    batch_size: usize,
    batch_timeout: Duration,
    max_retry_delay: Duration,
    debug: bool,
    auth: AuthSettings,
}

impl PipelineConfigBuilder {
    pub fn new(endpoint: impl Into<String>, actor: Actor) -> Self {
        Self {
            endpoint: endpoint.into(),
            actor,
            backup: None,
            uri_prefix: DEFAULT_URI_PREFIX.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            debug: false,
            auth: AuthSettings::None,
        }
    }

    pub fn backup(self, endpoint: impl Into<String>, format: BackupFormat) -> Self {
        self.backup_with(endpoint, format, BTreeMap::new(), BTreeMap::new())
    }

    pub fn backup_with(
        mut self,
        endpoint: impl Into<String>,
        format: BackupFormat,
        headers: BTreeMap<String, String>,
        query: BTreeMap<String, String>,
    ) -> Self {
        self.backup = Some((endpoint.into(), format, headers, query));
        self
    }

    pub fn uri_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.uri_prefix = prefix.into();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth = AuthSettings::Bearer {
            token: token.into(),
        };
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = AuthSettings::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    pub fn oauth2_settings(mut self, settings: OAuth2Settings) -> Self {
        self.auth = AuthSettings::OAuth2(settings);
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let endpoint = parse_url("endpoint", &self.endpoint)?;

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "batch_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_retry_delay.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "max_retry_delay",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.actor.name.trim().is_empty() {
            return Err(ConfigError::MissingField("actor.name"));
        }

        let backup = self
            .backup
            .map(|(url, format, headers, query)| {
                Ok::<_, ConfigError>(BackupConfig {
                    endpoint: parse_url("backup.endpoint", &url)?,
                    format,
                    headers,
                    query,
                })
            })
            .transpose()?;

        Ok(PipelineConfig {
            endpoint,
            backup,
            actor: self.actor,
            uri_prefix: self.uri_prefix,
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout,
            max_retry_delay: self.max_retry_delay,
            debug: self.debug,
            auth: self.auth.validate()?,
        })
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { field, source })
}

fn require(field: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingField(field))
}

/// Raw, unvalidated settings as read from file or environment
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub endpoint: String,
    pub actor: ActorSettings,
    #[serde(default)]
    pub backup: Option<BackupSettings>,
    #[serde(default = "default_uri_prefix")]
    pub uri_prefix: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorSettings {
    pub name: String,
    pub home_page: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSettings {
    pub endpoint: String,
    #[serde(default = "default_backup_format")]
    pub format: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthSettings {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    OAuth2(OAuth2Settings),
}

impl AuthSettings {
    fn validate(self) -> Result<AuthConfig, ConfigError> {
        match self {
            AuthSettings::None => Ok(AuthConfig::None),
            AuthSettings::Bearer { token } => Ok(AuthConfig::Bearer {
                token: require("auth.token", Some(token))?,
            }),
            AuthSettings::Basic { username, password } => Ok(AuthConfig::Basic {
                username: require("auth.username", Some(username))?,
                password,
            }),
            AuthSettings::OAuth2(settings) => Ok(AuthConfig::OAuth2(settings.validate()?)),
        }
    }
}

/// Raw OAuth2 settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuth2Settings {
    pub token_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub grant_type: Option<String>,
    pub scope: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub login_hint: Option<String>,
    pub refresh_token: Option<String>,
}

impl OAuth2Settings {
    fn validate(self) -> Result<OAuth2Config, ConfigError> {
        let token_endpoint = parse_url(
            "auth.token_endpoint",
            self.token_endpoint.as_deref().unwrap_or_default(),
        )?;
        let revocation_endpoint = self
            .revocation_endpoint
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_url("auth.revocation_endpoint", &v))
            .transpose()?;
        let client_id = require("auth.client_id", self.client_id)?;

        let grant_type = require("auth.grant_type", self.grant_type)?;
        let grant = match grant_type.as_str() {
            "password" => GrantType::Password {
                username: require("auth.username", self.username)?,
                password: require("auth.password", self.password)?,
                login_hint: self.login_hint,
            },
            "refresh_token" => GrantType::RefreshToken {
                refresh_token: require("auth.refresh_token", self.refresh_token)?,
            },
            other => return Err(ConfigError::UnsupportedGrantType(other.to_string())),
        };

        Ok(OAuth2Config {
            token_endpoint,
            revocation_endpoint,
            client_id,
            client_secret: self.client_secret,
            scope: self.scope,
            grant,
        })
    }
}

fn default_uri_prefix() -> String {
    DEFAULT_URI_PREFIX.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_timeout_ms() -> u64 {
    DEFAULT_BATCH_TIMEOUT.as_millis() as u64
}

fn default_max_retry_delay_ms() -> u64 {
    DEFAULT_MAX_RETRY_DELAY.as_millis() as u64
}

fn default_backup_format() -> String {
    "json".to_string()
}
