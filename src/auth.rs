use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::error::SyncError;
use crate::engine::store::RemoteStore;
use crate::engine::Authenticator;
use crate::sheets::SheetsClient;

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens expiring within this margin are refreshed up front.
const EXPIRY_SKEW_SECONDS: i64 = 60;

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

/// OAuth credentials as stored on disk. Obtaining them in the first place
/// happens outside this tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl StoredCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse credentials {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now + Duration::seconds(EXPIRY_SKEW_SECONDS) >= at)
    }
}

#[derive(Debug, Serialize)]
struct RefreshTokenRequest<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

async fn refresh_access_token(creds: &StoredCredentials, refresh_token: &str) -> Result<TokenResponse> {
    let params = RefreshTokenRequest {
        grant_type: "refresh_token",
        refresh_token,
        client_id: creds.client_id.as_deref(),
        client_secret: creds.client_secret.as_deref(),
    };

    let response = reqwest::Client::new()
        .post(&creds.token_url)
        .form(&params)
        .send()
        .await
        .context("failed to refresh token")?;

    if !response.status().is_success() {
        bail!(
            "token refresh failed ({}): {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
    }

    response
        .json::<TokenResponse>()
        .await
        .context("failed to parse refresh token response")
}

/// Returns credentials valid at `now`, refreshing and saving them to `path`
/// when they have expired.
pub async fn refresh_if_needed(
    path: &Path,
    mut creds: StoredCredentials,
    now: DateTime<Utc>,
) -> Result<StoredCredentials> {
    if !creds.is_expired(now) {
        return Ok(creds);
    }
    let Some(refresh_token) = creds.refresh_token.clone() else {
        bail!(
            "access token in {} expired and no refresh token is available",
            path.display()
        );
    };

    info!(credentials = %path.display(), "access token expired, refreshing");
    let token = refresh_access_token(&creds, &refresh_token).await?;
    creds.access_token = token.access_token;
    if let Some(new_refresh) = token.refresh_token {
        creds.refresh_token = Some(new_refresh);
    }
    creds.expires_at = token.expires_in.map(|secs| now + Duration::seconds(secs));
    creds.save(path)?;
    debug!(token = %mask_token(&creds.access_token), "saved refreshed credentials");
    Ok(creds)
}

fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

/// Uses a token supplied directly, e.g. via `--access-token`.
pub struct StaticTokenAuthenticator {
    api_url: String,
    spreadsheet_id: String,
    access_token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(api_url: &str, spreadsheet_id: &str, access_token: &str) -> Self {
        Self {
            api_url: api_url.to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            access_token: access_token.to_string(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn get_valid_client(&self) -> Result<Arc<dyn RemoteStore>, SyncError> {
        if self.access_token.trim().is_empty() {
            return Err(SyncError::Auth("access token is empty".into()));
        }
        let client = SheetsClient::new(&self.api_url, &self.spreadsheet_id, &self.access_token)
            .map_err(|err| SyncError::Auth(err.to_string()))?;
        Ok(Arc::new(client))
    }
}

/// Reads a stored credential file, refreshing it when expired. Concurrent
/// runs share one refresh.
pub struct CredentialsAuthenticator {
    api_url: String,
    spreadsheet_id: String,
    path: PathBuf,
    cached: Mutex<Option<StoredCredentials>>,
}

impl CredentialsAuthenticator {
    pub fn new(api_url: &str, spreadsheet_id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            api_url: api_url.to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    async fn valid_credentials(&self) -> Result<StoredCredentials> {
        let mut cached = self.cached.lock().await;
        let creds = match cached.take() {
            Some(creds) => creds,
            None => StoredCredentials::load(&self.path)?,
        };
        let creds = refresh_if_needed(&self.path, creds, Utc::now()).await?;
        *cached = Some(creds.clone());
        Ok(creds)
    }
}

#[async_trait]
impl Authenticator for CredentialsAuthenticator {
    async fn get_valid_client(&self) -> Result<Arc<dyn RemoteStore>, SyncError> {
        let creds = self
            .valid_credentials()
            .await
            .map_err(|err| SyncError::Auth(format!("{err:#}")))?;
        let client = SheetsClient::new(&self.api_url, &self.spreadsheet_id, &creds.access_token)
            .map_err(|err| SyncError::Auth(err.to_string()))?;
        Ok(Arc::new(client))
    }
}

/// Default location of the stored credential file.
pub fn default_credentials_path() -> Result<PathBuf> {
    Ok(crate::config::global_config_dir()?.join("credentials.json"))
}
