//! OAuth2 token lifecycle
//!
//! Tokens are acquired with the configured password or refresh-token grant
//! and renewed with the refresh-token grant. Concurrent refresh requests
//! coalesce into a single exchange with the token endpoint; callers that
//! arrive while an exchange is running receive its outcome.

use super::{CredentialKind, CredentialProvider};
use crate::config::{GrantType, OAuth2Config};
use crate::error::AuthError;
use crate::observability::StructuredLogger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Tokens this close to expiry are refreshed before use
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// An issued access token and what is needed to renew it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBundle {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

impl TokenBundle {
    /// True once `now` is within [`EXPIRY_MARGIN`] of the expiry instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::seconds(EXPIRY_MARGIN.as_secs() as i64);
        now + margin >= self.expires_at
    }

    /// Value for the `Authorization` header
    pub fn header_value(&self) -> String {
        if self.token_type.eq_ignore_ascii_case("bearer") {
            format!("Bearer {}", self.access_token)
        } else {
            format!("{} {}", self.token_type, self.access_token)
        }
    }
}

/// Where the credential is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    NoToken,
    Valid,
    Refreshing,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

type TokenListener = Arc<dyn Fn(&TokenBundle) + Send + Sync>;

/// Result of the most recent completed exchange
#[derive(Default)]
struct RefreshRound {
    completed: u64,
    last: Option<Result<(), AuthError>>,
}

/// OAuth2 credential with single-flight refresh
pub struct OAuth2Credentials {
    config: OAuth2Config,
    client: reqwest::Client,
    token: RwLock<Option<TokenBundle>>,
    listeners: RwLock<Vec<TokenListener>>,
    refresh_gate: Mutex<RefreshRound>,
    rounds: AtomicU64,
    /// Bumped by every logout; exchanges started before a logout are discarded
    logouts: AtomicU64,
    refreshing: AtomicBool,
    logger: StructuredLogger,
}

impl OAuth2Credentials {
    pub fn new(config: OAuth2Config, client: reqwest::Client, logger: StructuredLogger) -> Self {
        Self {
            config,
            client,
            token: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            refresh_gate: Mutex::new(RefreshRound::default()),
            rounds: AtomicU64::new(0),
            logouts: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
            logger,
        }
    }

    /// Register a callback invoked with every newly issued token
    pub async fn on_token_update<F>(&self, listener: F)
    where
        F: Fn(&TokenBundle) + Send + Sync + 'static,
    {
        self.listeners.write().await.push(Arc::new(listener));
    }

    /// Currently held token, if any
    pub async fn token(&self) -> Option<TokenBundle> {
        self.token.read().await.clone()
    }

    pub async fn phase(&self) -> TokenPhase {
        if self.refreshing.load(Ordering::SeqCst) {
            TokenPhase::Refreshing
        } else if self.token.read().await.is_some() {
            TokenPhase::Valid
        } else {
            TokenPhase::NoToken
        }
    }

    /// Run one exchange, or join the exchange already in flight
    async fn refresh_single_flight(&self) -> Result<(), AuthError> {
        let observed = self.rounds.load(Ordering::SeqCst);
        let mut round = self.refresh_gate.lock().await;

        if round.completed != observed {
            // An exchange finished while this caller waited for the gate
            return match &round.last {
                Some(Err(err)) => Err(AuthError::Refresh(err.to_string())),
                _ => Ok(()),
            };
        }

        let generation = self.logouts.load(Ordering::SeqCst);
        self.refreshing.store(true, Ordering::SeqCst);
        let outcome = self.exchange().await;
        self.refreshing.store(false, Ordering::SeqCst);

        round.completed += 1;
        self.rounds.store(round.completed, Ordering::SeqCst);

        let outcome = match outcome {
            Ok(bundle) => self.install(bundle, generation).await,
            Err(err) => {
                self.logger.log_credential_refresh_failed(&err.to_string());
                Err(err)
            }
        };

        round.last = Some(outcome.clone());
        outcome
    }

    /// Store an issued token unless a logout happened since `generation`
    async fn install(&self, bundle: TokenBundle, generation: u64) -> Result<(), AuthError> {
        {
            let mut token = self.token.write().await;
            // Checked under the token lock, which logout also takes
            if self.logouts.load(Ordering::SeqCst) != generation {
                debug!("Logged out during token exchange, discarding issued token");
                return Err(AuthError::NotLoggedIn);
            }
            *token = Some(bundle.clone());
        }

        self.logger.log_credential_refreshed(bundle.expires_at);
        for listener in self.listeners.read().await.iter() {
            listener(&bundle);
        }
        Ok(())
    }

    async fn exchange(&self) -> Result<TokenBundle, AuthError> {
        let held_refresh_token = self
            .token
            .read()
            .await
            .as_ref()
            .and_then(|bundle| bundle.refresh_token.clone());

        let form = self.grant_form(held_refresh_token);
        let requested_at = Utc::now();

        debug!(endpoint = %self.config.token_endpoint, "Requesting OAuth2 token");
        let response = self
            .client
            .post(self.config.token_endpoint.clone())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let data: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        if data.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        let lifetime = data.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let refresh_token = match data.refresh_token {
            Some(token) => Some(token),
            None => form
                .iter()
                .find(|(key, _)| *key == "refresh_token")
                .map(|(_, value)| value.clone()),
        };

        Ok(TokenBundle {
            access_token: data.access_token,
            token_type: data.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: requested_at + chrono::Duration::seconds(lifetime),
            refresh_token,
        })
    }

    /// Form fields for the next exchange. A held refresh token always wins
    /// over the configured initial grant.
    fn grant_form(&self, held_refresh_token: Option<String>) -> Vec<(&'static str, String)> {
        let refresh_token = held_refresh_token.or_else(|| match &self.config.grant {
            GrantType::RefreshToken { refresh_token } => Some(refresh_token.clone()),
            GrantType::Password { .. } => None,
        });

        let mut form = Vec::new();
        match (refresh_token, &self.config.grant) {
            (Some(token), _) => {
                form.push(("grant_type", "refresh_token".to_string()));
                form.push(("refresh_token", token));
            }
            (
                None,
                GrantType::Password {
                    username,
                    password,
                    login_hint,
                },
            ) => {
                form.push(("grant_type", "password".to_string()));
                form.push(("username", username.clone()));
                form.push(("password", password.clone()));
                if let Some(hint) = login_hint {
                    form.push(("login_hint", hint.clone()));
                }
            }
            (None, GrantType::RefreshToken { refresh_token }) => {
                form.push(("grant_type", "refresh_token".to_string()));
                form.push(("refresh_token", refresh_token.clone()));
            }
        }

        form.push(("client_id", self.config.client_id.clone()));
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(scope) = &self.config.scope {
            form.push(("scope", scope.clone()));
        }
        form
    }

    async fn revoke(&self, bundle: TokenBundle) {
        let Some(endpoint) = &self.config.revocation_endpoint else {
            return;
        };

        let (token, hint) = match bundle.refresh_token {
            Some(refresh_token) => (refresh_token, "refresh_token"),
            None => (bundle.access_token, "access_token"),
        };
        let form = [
            ("token", token),
            ("token_type_hint", hint.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];

        match self.client.post(endpoint.clone()).form(&form).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Token revoked");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "Token revocation rejected");
            }
            Err(e) => {
                warn!(error = %e, "Token revocation failed");
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuth2Credentials {
    fn kind(&self) -> CredentialKind {
        CredentialKind::OAuth2
    }

    async fn is_available(&self) -> bool {
        self.token.read().await.is_some()
    }

    async fn authorize(&self) -> Result<(), AuthError> {
        let fresh = self
            .token
            .read()
            .await
            .as_ref()
            .map(|bundle| !bundle.is_expired(Utc::now()))
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }
        self.refresh_single_flight().await
    }

    async fn current_auth_header(&self) -> Result<Option<String>, AuthError> {
        let expired = match self.token.read().await.as_ref() {
            None => return Err(AuthError::NotLoggedIn),
            Some(bundle) => bundle.is_expired(Utc::now()),
        };

        if expired {
            self.refresh_single_flight().await?;
        }

        self.token
            .read()
            .await
            .as_ref()
            .map(|bundle| Some(bundle.header_value()))
            .ok_or(AuthError::NotLoggedIn)
    }

    async fn refresh(&self) -> Result<bool, AuthError> {
        self.refresh_single_flight().await.map(|_| true)
    }

    async fn logout(&self) -> Result<(), AuthError> {
        let previous = {
            let mut token = self.token.write().await;
            self.logouts.fetch_add(1, Ordering::SeqCst);
            token.take()
        };
        if let Some(bundle) = previous {
            self.revoke(bundle).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::sync::Mutex as StdMutex;
    use url::Url;

    fn password_config(server: &Server) -> OAuth2Config {
        OAuth2Config {
            token_endpoint: Url::parse(&format!("{}/token", server.url())).unwrap(),
            revocation_endpoint: Some(Url::parse(&format!("{}/revoke", server.url())).unwrap()),
            client_id: "tracker".to_string(),
            client_secret: None,
            scope: Some("statements/write".to_string()),
            grant: GrantType::Password {
                username: "alice".to_string(),
                password: "secret".to_string(),
                login_hint: None,
            },
        }
    }

    fn logger() -> StructuredLogger {
        StructuredLogger::new("learner-1")
    }

    fn token_body(access: &str, refresh: &str, expires_in: i64) -> String {
        format!(
            r#"{{"access_token":"{access}","token_type":"bearer","expires_in":{expires_in},"refresh_token":"{refresh}"}}"#
        )
    }

    async fn mock_password_grant(server: &mut Server) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("username".into(), "alice".into()),
                Matcher::UrlEncoded("password".into(), "secret".into()),
                Matcher::UrlEncoded("client_id".into(), "tracker".into()),
                Matcher::UrlEncoded("scope".into(), "statements/write".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a1", "r1", 3600))
            .expect(1)
            .create_async()
            .await
    }

    #[test]
    fn test_token_expiry_margin() {
        let now = Utc::now();
        let bundle = TokenBundle {
            access_token: "a".to_string(),
            token_type: "bearer".to_string(),
            expires_at: now + chrono::Duration::seconds(60),
            refresh_token: None,
        };
        assert!(!bundle.is_expired(now));
        assert!(bundle.is_expired(now + chrono::Duration::seconds(31)));
        assert!(bundle.is_expired(now + chrono::Duration::seconds(120)));
        assert_eq!(bundle.header_value(), "Bearer a");
    }

    #[tokio::test]
    async fn test_password_grant_login() {
        let mut server = Server::new_async().await;
        let grant = mock_password_grant(&mut server).await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        assert_eq!(creds.phase().await, TokenPhase::NoToken);
        assert!(matches!(
            creds.current_auth_header().await,
            Err(AuthError::NotLoggedIn)
        ));

        let before = Utc::now();
        creds.authorize().await.unwrap();
        grant.assert_async().await;

        assert_eq!(creds.phase().await, TokenPhase::Valid);
        assert_eq!(
            creds.current_auth_header().await.unwrap().as_deref(),
            Some("Bearer a1")
        );
        let token = creds.token().await.unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("r1"));
        assert!(token.expires_at >= before + chrono::Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_refresh_uses_refresh_token() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
                Matcher::UrlEncoded("client_id".into(), "tracker".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a2","token_type":"Bearer","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        creds.authorize().await.unwrap();
        assert!(creds.refresh().await.unwrap());
        refresh.assert_async().await;

        let token = creds.token().await.unwrap();
        assert_eq!(token.access_token, "a2");
        // Endpoint omitted a new refresh token, so the old one is kept
        assert_eq!(token.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a2", "r2", 3600))
            .expect(1)
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        creds.authorize().await.unwrap();

        let (a, b, c) = tokio::join!(creds.refresh(), creds.refresh(), creds.refresh());
        assert!(a.unwrap() && b.unwrap() && c.unwrap());
        refresh.assert_async().await;

        assert_eq!(
            creds.current_auth_header().await.unwrap().as_deref(),
            Some("Bearer a2")
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_prior_token() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let _refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        creds.authorize().await.unwrap();

        let err = creds.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::Exchange { status: 400, .. }));
        assert_eq!(creds.phase().await, TokenPhase::Valid);
        assert_eq!(
            creds.current_auth_header().await.unwrap().as_deref(),
            Some("Bearer a1")
        );
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_before_use() {
        let mut server = Server::new_async().await;
        // Lifetime shorter than the expiry margin: stale as soon as it is issued
        let _grant = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "password".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a1", "r1", 10))
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a2", "r2", 3600))
            .expect(1)
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        creds.authorize().await.unwrap();

        assert_eq!(
            creds.current_auth_header().await.unwrap().as_deref(),
            Some("Bearer a2")
        );
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_listeners_receive_each_token() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let _refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a2", "r2", 3600))
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        creds
            .on_token_update(move |bundle| sink.lock().unwrap().push(bundle.access_token.clone()))
            .await;

        creds.authorize().await.unwrap();
        creds.refresh().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a1".to_string(), "a2".to_string()]);
    }

    #[tokio::test]
    async fn test_configured_refresh_token_grant() {
        let mut server = Server::new_async().await;
        let grant = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "seed".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a1", "r1", 3600))
            .expect(1)
            .create_async()
            .await;

        let mut config = password_config(&server);
        config.grant = GrantType::RefreshToken {
            refresh_token: "seed".to_string(),
        };
        let creds = OAuth2Credentials::new(config, reqwest::Client::new(), logger());
        creds.authorize().await.unwrap();
        grant.assert_async().await;
        assert!(creds.is_available().await);
    }

    #[tokio::test]
    async fn test_logout_revokes_refresh_token() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let revoke = server
            .mock("POST", "/revoke")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("token".into(), "r1".into()),
                Matcher::UrlEncoded("token_type_hint".into(), "refresh_token".into()),
            ]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        creds.authorize().await.unwrap();
        creds.logout().await.unwrap();
        revoke.assert_async().await;

        assert!(!creds.is_available().await);
        assert_eq!(creds.phase().await, TokenPhase::NoToken);
        assert!(creds.current_auth_header().await.is_err());
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_issued_token() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let refresh = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("a2", "r2", 3600))
            .expect(1)
            .create_async()
            .await;

        let mut config = password_config(&server);
        config.revocation_endpoint = None;
        let creds = OAuth2Credentials::new(config, reqwest::Client::new(), logger());
        creds.authorize().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        creds
            .on_token_update(move |bundle| sink.lock().unwrap().push(bundle.access_token.clone()))
            .await;

        // The exchange is on the wire when logout runs
        let (refreshed, logged_out) = tokio::join!(creds.refresh(), creds.logout());
        assert!(logged_out.is_ok());
        assert!(matches!(refreshed, Err(AuthError::NotLoggedIn)));
        refresh.assert_async().await;

        assert!(!creds.is_available().await);
        assert_eq!(creds.phase().await, TokenPhase::NoToken);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logout_tolerates_revocation_failure() {
        let mut server = Server::new_async().await;
        let _grant = mock_password_grant(&mut server).await;
        let _revoke = server
            .mock("POST", "/revoke")
            .with_status(503)
            .create_async()
            .await;

        let creds = OAuth2Credentials::new(
            password_config(&server),
            reqwest::Client::new(),
            logger(),
        );
        creds.authorize().await.unwrap();
        assert!(creds.logout().await.is_ok());
        assert!(!creds.is_available().await);
    }
}
