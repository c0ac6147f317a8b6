//! Access tokens for the Google APIs
//!
//! Tokens come from, in order of preference:
//!
//! 1. `TURBINE_ACCESS_TOKEN` (or an emulator, which accepts any token)
//! 2. gcloud application-default credentials of type `authorized_user`
//! 3. the Compute Engine metadata server, which is what workers use

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Result, TurbineError};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
const TOKEN_ENV: &str = "TURBINE_ACCESS_TOKEN";

/// Seconds before expiry at which a cached token is refreshed
const REFRESH_MARGIN_SECS: i64 = 60;

/// A bearer token
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// True if the token is still usable at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now + Duration::seconds(REFRESH_MARGIN_SECS) < expiry,
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_token(self) -> AccessToken {
        AccessToken {
            value: self.access_token,
            expires_at: self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }
}

/// Source of bearer tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a token valid for at least a short while
    async fn token(&self) -> Result<AccessToken>;
}

/// A fixed token
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            value: self.0.clone(),
            expires_at: None,
        })
    }
}

/// Tokens for the instance's service account from the metadata server
pub struct MetadataServer {
    client: Client,
    base_url: String,
}

impl MetadataServer {
    /// Create a metadata server client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: METADATA_URL.to_string(),
        }
    }

    /// Read a plain-text metadata value, e.g. `instance/name`
    pub async fn value(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| TurbineError::Network(format!("metadata server unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(TurbineError::auth(format!(
                "metadata server returned {} for {}",
                resp.status(),
                path
            )));
        }
        Ok(resp.text().await?.trim().to_string())
    }

    /// True when running on Compute Engine
    pub async fn is_available(&self) -> bool {
        self.value("project/project-id").await.is_ok()
    }

    /// Name of the current instance
    pub async fn instance_name(&self) -> Result<String> {
        self.value("instance/name").await
    }

    /// Zone of the current instance (the last path segment of `instance/zone`)
    pub async fn instance_zone(&self) -> Result<String> {
        let zone = self.value("instance/zone").await?;
        Ok(zone.rsplit('/').next().unwrap_or(&zone).to_string())
    }
}

#[async_trait]
impl TokenProvider for MetadataServer {
    async fn token(&self) -> Result<AccessToken> {
        let url = format!("{}/instance/service-accounts/default/token", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| TurbineError::auth(format!("metadata token request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(TurbineError::auth(format!(
                "metadata token request returned {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp.json().await?;
        Ok(token.into_token())
    }
}

/// gcloud application-default credentials file
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

impl CredentialsFile {
    /// Location of the credentials, honoring `GOOGLE_APPLICATION_CREDENTIALS`
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|dir| dir.join("gcloud").join("application_default_credentials.json"))
    }

    /// Read a credentials file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Tokens minted from a user refresh token
pub struct AuthorizedUser {
    client: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl AuthorizedUser {
    /// Build from a parsed credentials file
    pub fn from_credentials(client: Client, creds: CredentialsFile) -> Result<Self> {
        if creds.kind != "authorized_user" {
            return Err(TurbineError::auth(format!(
                "unsupported credentials type '{}': run `gcloud auth application-default login` or set {}",
                creds.kind, TOKEN_ENV
            )));
        }

        let missing = |field: &str| TurbineError::auth(format!("credentials file is missing {}", field));
        Ok(Self {
            client,
            client_id: creds.client_id.ok_or_else(|| missing("client_id"))?,
            client_secret: creds.client_secret.ok_or_else(|| missing("client_secret"))?,
            refresh_token: creds.refresh_token.ok_or_else(|| missing("refresh_token"))?,
        })
    }
}

#[async_trait]
impl TokenProvider for AuthorizedUser {
    async fn token(&self) -> Result<AccessToken> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|e| TurbineError::auth(format!("refresh request failed: {}", e)))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TurbineError::auth(format!("refresh failed: {}", body)));
        }

        let token: TokenResponse = resp.json().await?;
        Ok(token.into_token())
    }
}

/// Reuses a token until shortly before it expires
pub struct CachedToken<P> {
    inner: P,
    cached: Mutex<Option<AccessToken>>,
}

impl<P: TokenProvider> CachedToken<P> {
    /// Wrap a provider
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: TokenProvider> TokenProvider for CachedToken<P> {
    async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        tracing::debug!("Refreshing access token");
        let token = self.inner.token().await?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

/// Pick a token provider from the environment
pub async fn default_provider(client: Client) -> Result<Arc<dyn TokenProvider>> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.is_empty() {
            tracing::debug!("Using access token from {}", TOKEN_ENV);
            return Ok(Arc::new(StaticToken(token)));
        }
    }

    if std::env::var("PUBSUB_EMULATOR_HOST").is_ok() && std::env::var("STORAGE_EMULATOR_HOST").is_ok() {
        tracing::debug!("Emulators configured, using a placeholder token");
        return Ok(Arc::new(StaticToken("owner".to_string())));
    }

    if let Some(path) = CredentialsFile::default_path() {
        if path.exists() {
            tracing::debug!(path = %path.display(), "Using application-default credentials");
            let creds = CredentialsFile::load(&path)?;
            let user = AuthorizedUser::from_credentials(client, creds)?;
            return Ok(Arc::new(CachedToken::new(user)));
        }
    }

    let metadata = MetadataServer::new(client);
    if metadata.is_available().await {
        tracing::debug!("Using the metadata server service account");
        return Ok(Arc::new(CachedToken::new(metadata)));
    }

    Err(TurbineError::auth(format!(
        "no credentials found: run `gcloud auth application-default login` or set {}",
        TOKEN_ENV
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        lifetime_secs: i64,
    }

    #[async_trait]
    impl TokenProvider for Counting {
        async fn token(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                value: format!("token-{}", n),
                expires_at: Some(Utc::now() + Duration::seconds(self.lifetime_secs)),
            })
        }
    }

    #[tokio::test]
    async fn test_cache_reuses_fresh_token() {
        let cache = CachedToken::new(Counting {
            calls: AtomicUsize::new(0),
            lifetime_secs: 3600,
        });
        assert_eq!(cache.token().await.unwrap().value, "token-0");
        assert_eq!(cache.token().await.unwrap().value, "token-0");
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_refreshes_near_expiry() {
        let cache = CachedToken::new(Counting {
            calls: AtomicUsize::new(0),
            lifetime_secs: 30,
        });
        assert_eq!(cache.token().await.unwrap().value, "token-0");
        assert_eq!(cache.token().await.unwrap().value, "token-1");
    }

    #[test]
    fn test_service_account_credentials_are_rejected() {
        let creds: CredentialsFile =
            serde_json::from_str(r#"{"type":"service_account","client_id":"x"}"#).unwrap();
        assert!(AuthorizedUser::from_credentials(Client::new(), creds).is_err());

        let creds: CredentialsFile = serde_json::from_str(
            r#"{"type":"authorized_user","client_id":"a","client_secret":"b","refresh_token":"c"}"#,
        )
        .unwrap();
        assert!(AuthorizedUser::from_credentials(Client::new(), creds).is_ok());
    }
}
