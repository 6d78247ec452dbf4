//! Credential providers for authorizing collector requests
//!
//! The pipeline only sees the [`CredentialProvider`] capability. Three
//! variants implement it:
//! - [`Anonymous`]: no `Authorization` header at all
//! - [`StaticToken`]: a fixed bearer or basic credential that cannot be renewed
//! - [`OAuth2Credentials`]: token bundle with single-flight refresh

mod oauth2;

pub use oauth2::{OAuth2Credentials, TokenBundle, TokenPhase, EXPIRY_MARGIN};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::observability::StructuredLogger;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Which kind of credential a provider holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    None,
    Token,
    OAuth2,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::None => "none",
            CredentialKind::Token => "token",
            CredentialKind::OAuth2 => "oauth2",
        }
    }
}

/// Capability the pipeline uses to authorize, renew and drop credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Kind of credential held by this provider
    fn kind(&self) -> CredentialKind;

    /// Whether a credential is currently held
    async fn is_available(&self) -> bool;

    /// Acquire the initial credential (login)
    async fn authorize(&self) -> Result<(), AuthError>;

    /// `Authorization` header value for the next request, refreshing an
    /// expired credential first. `None` means the request goes unauthenticated.
    async fn current_auth_header(&self) -> Result<Option<String>, AuthError>;

    /// Renew the credential. `Ok(true)` when a renewed credential is in place,
    /// `Ok(false)` when this kind of credential cannot be renewed.
    async fn refresh(&self) -> Result<bool, AuthError>;

    /// Drop the credential, invalidating it server-side where supported
    async fn logout(&self) -> Result<(), AuthError>;
}

/// Build the provider selected by the configuration
pub fn provider_from_config(
    auth: &AuthConfig,
    client: reqwest::Client,
    logger: StructuredLogger,
) -> Arc<dyn CredentialProvider> {
    match auth {
        AuthConfig::None => Arc::new(Anonymous::new()),
        AuthConfig::Bearer { token } => Arc::new(StaticToken::bearer(token)),
        AuthConfig::Basic { username, password } => Arc::new(StaticToken::basic(username, password)),
        AuthConfig::OAuth2(config) => {
            Arc::new(OAuth2Credentials::new(config.clone(), client, logger))
        }
    }
}

/// No credential; requests carry no `Authorization` header
#[derive(Debug)]
pub struct Anonymous {
    active: AtomicBool,
}

impl Anonymous {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }
}

impl Default for Anonymous {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for Anonymous {
    fn kind(&self) -> CredentialKind {
        CredentialKind::None
    }

    async fn is_available(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn authorize(&self) -> Result<(), AuthError> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn current_auth_header(&self) -> Result<Option<String>, AuthError> {
        if self.active.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Err(AuthError::NotLoggedIn)
        }
    }

    async fn refresh(&self) -> Result<bool, AuthError> {
        Ok(false)
    }

    async fn logout(&self) -> Result<(), AuthError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Fixed bearer or basic credential
pub struct StaticToken {
    configured: String,
    header: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn bearer(token: &str) -> Self {
        Self::from_header(format!("Bearer {token}"))
    }

    pub fn basic(username: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        Self::from_header(format!("Basic {encoded}"))
    }

    fn from_header(header: String) -> Self {
        Self {
            header: RwLock::new(Some(header.clone())),
            configured: header,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Token
    }

    async fn is_available(&self) -> bool {
        self.header.read().await.is_some()
    }

    async fn authorize(&self) -> Result<(), AuthError> {
        *self.header.write().await = Some(self.configured.clone());
        Ok(())
    }

    async fn current_auth_header(&self) -> Result<Option<String>, AuthError> {
        self.header
            .read()
            .await
            .clone()
            .map(Some)
            .ok_or(AuthError::NotLoggedIn)
    }

    async fn refresh(&self) -> Result<bool, AuthError> {
        Ok(false)
    }

    async fn logout(&self) -> Result<(), AuthError> {
        *self.header.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_anonymous_provider() {
        let provider = Anonymous::new();
        assert_eq!(provider.kind(), CredentialKind::None);
        assert!(provider.is_available().await);
        assert_eq!(provider.current_auth_header().await.unwrap(), None);
        assert!(!provider.refresh().await.unwrap());

        provider.logout().await.unwrap();
        assert!(!provider.is_available().await);
        assert!(matches!(
            provider.current_auth_header().await,
            Err(AuthError::NotLoggedIn)
        ));

        provider.authorize().await.unwrap();
        assert!(provider.is_available().await);
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let provider = StaticToken::bearer("abc123");
        assert_eq!(provider.kind(), CredentialKind::Token);
        assert_eq!(
            provider.current_auth_header().await.unwrap().as_deref(),
            Some("Bearer abc123")
        );
    }

    #[tokio::test]
    async fn test_basic_header() {
        let provider = StaticToken::basic("user", "pass");
        assert_eq!(
            provider.current_auth_header().await.unwrap().as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
        assert!(!provider.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_static_logout_and_login() {
        let provider = StaticToken::bearer("abc123");
        provider.logout().await.unwrap();
        assert!(!provider.is_available().await);
        assert!(provider.current_auth_header().await.is_err());

        provider.authorize().await.unwrap();
        assert!(provider.is_available().await);
    }

    #[test]
    fn test_provider_from_config() {
        let client = reqwest::Client::new();
        let logger = StructuredLogger::new("learner-1");
        let provider = provider_from_config(
            &AuthConfig::Bearer {
                token: "t".to_string(),
            },
            client.clone(),
            logger.clone(),
        );
        assert_eq!(provider.kind(), CredentialKind::Token);
        assert_eq!(provider.kind().as_str(), "token");

        let provider = provider_from_config(&AuthConfig::None, client, logger);
        assert_eq!(provider.kind(), CredentialKind::None);
    }
}
