//! Google OAuth2 credentials and tokens.
//!
//! Two files on disk:
//! - `credentials.json`: client secrets downloaded from the Google Cloud
//!   console (`installed` or `web` application).
//! - `token.json`: the authorized-user token, rewritten after every refresh.
//!
//! [`CredentialStore`] keeps the current token in memory and hands out access
//! tokens through the [`TokenProvider`] trait, refreshing when they expire.
//! The interactive consent flow only runs from [`CredentialStore::ensure_authorized`],
//! never from inside the poll loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::GMAIL_MODIFY_SCOPE;
use crate::error::AuthError;

/// Default Google token endpoint.
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Default Google authorization endpoint.
pub const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";

/// How long to wait for the user to finish the consent screen.
const CONSENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Tokens are treated as expired this long before their real expiry.
const EXPIRY_BUFFER_SECS: i64 = 60;

// ── Client secrets ──────────────────────────────────────────────────

/// OAuth client registration from `credentials.json`.
#[derive(Debug, Clone)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: SecretString,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecretsEntry>,
    web: Option<ClientSecretsEntry>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsEntry {
    client_id: String,
    client_secret: String,
    #[serde(default = "default_auth_uri")]
    auth_uri: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

impl ClientSecrets {
    /// Load and validate a client-secrets file.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            return Err(AuthError::MissingCredentials {
                path: path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw).map_err(|reason| AuthError::InvalidCredentials {
            path: path.display().to_string(),
            reason,
        })
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let file: ClientSecretsFile = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let entry = file
            .installed
            .or(file.web)
            .ok_or_else(|| "expected an \"installed\" or \"web\" client".to_string())?;
        if entry.client_id.trim().is_empty() {
            return Err("client_id is empty".into());
        }
        Ok(Self {
            client_id: entry.client_id,
            client_secret: SecretString::from(entry.client_secret),
            auth_uri: entry.auth_uri,
            token_uri: entry.token_uri,
        })
    }
}

// ── Token ───────────────────────────────────────────────────────────

/// Authorized-user token.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub scopes: Vec<String>,
}

impl Token {
    /// Checks if the token is expired (with 60 second buffer).
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|exp| Utc::now() + chrono::Duration::seconds(EXPIRY_BUFFER_SECS) >= exp)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }

    /// Read `token.json`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let file: TokenFile = serde_json::from_str(&raw)?;
        Ok(Some(file.into()))
    }

    /// Write `token.json`, readable only by the owner on Unix.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&TokenFile::from(self))?;
        std::fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// On-disk token layout (Google authorized-user format).
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    #[serde(default)]
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<DateTime<Utc>>,
}

impl From<TokenFile> for Token {
    fn from(file: TokenFile) -> Self {
        Self {
            access_token: SecretString::from(file.token),
            refresh_token: file.refresh_token.map(SecretString::from),
            expires_at: file.expiry,
            token_uri: file.token_uri,
            client_id: file.client_id,
            client_secret: file.client_secret.map(SecretString::from),
            scopes: file.scopes,
        }
    }
}

impl From<&Token> for TokenFile {
    fn from(token: &Token) -> Self {
        Self {
            token: token.access_token.expose_secret().to_string(),
            refresh_token: token
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            token_uri: token.token_uri.clone(),
            client_id: token.client_id.clone(),
            client_secret: token
                .client_secret
                .as_ref()
                .map(|s| s.expose_secret().to_string()),
            scopes: token.scopes.clone(),
            expiry: token.expires_at,
        }
    }
}

/// Token endpoint success response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Token endpoint error response.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

// ── Token provider seam ─────────────────────────────────────────────

/// Source of bearer tokens for Gmail requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<SecretString, AuthError>;

    /// Refresh even if the cached token looks valid (after a 401).
    async fn force_refresh(&self) -> Result<SecretString, AuthError>;
}

/// A fixed token. Useful against fake servers.
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<SecretString, AuthError> {
        Ok(self.0.clone())
    }

    async fn force_refresh(&self) -> Result<SecretString, AuthError> {
        Ok(self.0.clone())
    }
}

// ── Credential store ────────────────────────────────────────────────

/// Owns `credentials.json` and `token.json`.
pub struct CredentialStore {
    credentials_path: PathBuf,
    token_path: PathBuf,
    http: reqwest::Client,
    token: Mutex<Option<Token>>,
}

impl CredentialStore {
    pub fn new(credentials_path: impl Into<PathBuf>, token_path: impl Into<PathBuf>) -> Self {
        Self {
            credentials_path: credentials_path.into(),
            token_path: token_path.into(),
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Make sure a usable token exists, running the consent flow if needed.
    pub async fn ensure_authorized(&self) -> Result<(), AuthError> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            *guard = Token::load(&self.token_path)?;
        }

        if let Some(token) = guard.as_ref()
            && !token.has_scope(GMAIL_MODIFY_SCOPE)
        {
            warn!("Stored token lacks the gmail.modify scope, re-authorizing");
            *guard = None;
        }

        match guard.take() {
            Some(token) if !token.is_expired() => {
                debug!("Stored token is valid");
                *guard = Some(token);
            }
            Some(token) if token.can_refresh() => {
                let refreshed = self.refresh(&token).await?;
                *guard = Some(refreshed);
            }
            _ => {
                let token = self.authorize_interactive().await?;
                *guard = Some(token);
            }
        }
        Ok(())
    }

    /// Exchange the refresh token for a new access token and persist it.
    pub async fn refresh(&self, token: &Token) -> Result<Token, AuthError> {
        let refresh_token = token
            .refresh_token
            .as_ref()
            .ok_or_else(|| AuthError::ReauthRequired {
                reason: "no refresh token".into(),
            })?;

        let (client_id, client_secret) = self.client_identity(token)?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token.expose_secret());
        params.insert("client_id", client_id.as_str());
        params.insert("client_secret", client_secret.expose_secret());

        let response = self
            .http
            .post(&token.token_uri)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let error: ErrorResponse = response.json().await?;
            if error.error == "invalid_grant" {
                return Err(AuthError::ReauthRequired {
                    reason: format!("{}: {}", error.error, error.error_description),
                });
            }
            return Err(AuthError::OAuth {
                error: error.error,
                description: error.error_description,
            });
        }

        let response: TokenResponse = response.json().await?;
        let mut refreshed = Token {
            access_token: SecretString::from(response.access_token),
            refresh_token: response.refresh_token.map(SecretString::from),
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_uri: token.token_uri.clone(),
            client_id,
            client_secret: Some(client_secret),
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_else(|| token.scopes.clone()),
        };

        // Preserve refresh token if not returned
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token.clone_from(&token.refresh_token);
        }

        refreshed.save(&self.token_path)?;
        info!("Refreshed Gmail access token");
        Ok(refreshed)
    }

    /// Client ID and secret from the token, falling back to `credentials.json`.
    fn client_identity(&self, token: &Token) -> Result<(String, SecretString), AuthError> {
        if !token.client_id.is_empty()
            && let Some(secret) = &token.client_secret
        {
            return Ok((token.client_id.clone(), secret.clone()));
        }
        let secrets = ClientSecrets::load(&self.credentials_path)?;
        Ok((secrets.client_id, secrets.client_secret))
    }

    /// Installed-app consent flow over a loopback redirect.
    ///
    /// Prints the authorization URL, waits for Google to redirect back to
    /// `http://127.0.0.1:<port>/`, exchanges the code and writes `token.json`.
    pub async fn authorize_interactive(&self) -> Result<Token, AuthError> {
        let secrets = ClientSecrets::load(&self.credentials_path)?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
        let state = random_state();
        let auth_url = authorization_url(&secrets, &redirect_uri, &state)?;

        eprintln!();
        eprintln!("Open this URL in your browser to authorize Calm Mail:");
        eprintln!();
        eprintln!("  {auth_url}");
        eprintln!();
        info!(redirect_uri = %redirect_uri, "Waiting for OAuth consent");

        let (tx, mut rx) = mpsc::channel::<HashMap<String, String>>(1);
        let app = Router::new()
            .route("/", get(consent_callback))
            .with_state(tx);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let params = tokio::time::timeout(CONSENT_TIMEOUT, rx.recv()).await;
        let _ = shutdown_tx.send(());
        let _ = server.await;

        let params = params
            .map_err(|_| AuthError::Flow("timed out waiting for consent".into()))?
            .ok_or_else(|| AuthError::Flow("callback server stopped".into()))?;

        if let Some(error) = params.get("error") {
            return Err(AuthError::OAuth {
                error: error.clone(),
                description: "consent was not granted".into(),
            });
        }
        if params.get("state").map(String::as_str) != Some(state.as_str()) {
            return Err(AuthError::Flow("state mismatch in OAuth callback".into()));
        }
        let code = params
            .get("code")
            .ok_or_else(|| AuthError::Flow("callback missing authorization code".into()))?;

        let token = self.exchange_code(&secrets, code, &redirect_uri).await?;
        token.save(&self.token_path)?;
        info!(path = %self.token_path.display(), "Authorization complete, token saved");
        Ok(token)
    }

    async fn exchange_code(
        &self,
        secrets: &ClientSecrets,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Token, AuthError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("client_id", secrets.client_id.as_str());
        params.insert("client_secret", secrets.client_secret.expose_secret());
        params.insert("redirect_uri", redirect_uri);

        let response = self
            .http
            .post(&secrets.token_uri)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let error: ErrorResponse = response.json().await?;
            return Err(AuthError::OAuth {
                error: error.error,
                description: error.error_description,
            });
        }

        let response: TokenResponse = response.json().await?;
        Ok(Token {
            access_token: SecretString::from(response.access_token),
            refresh_token: response.refresh_token.map(SecretString::from),
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            token_uri: secrets.token_uri.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: Some(secrets.client_secret.clone()),
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_else(|| vec![GMAIL_MODIFY_SCOPE.to_string()]),
        })
    }

    /// Install a new client-secrets file and drop the old token.
    pub async fn import_credentials(&self, source: &Path) -> Result<(), AuthError> {
        ClientSecrets::load(source)?;

        if let Some(parent) = self.credentials_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        if source != self.credentials_path {
            std::fs::copy(source, &self.credentials_path)?;
        }
        if self.token_path.exists() {
            std::fs::remove_file(&self.token_path)?;
        }
        *self.token.lock().await = None;

        info!(
            source = %source.display(),
            dest = %self.credentials_path.display(),
            "Imported OAuth client credentials; authorization required"
        );
        Ok(())
    }

    async fn current_token(&self, force: bool) -> Result<SecretString, AuthError> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            *guard = Token::load(&self.token_path)?;
        }
        let token = guard.as_ref().ok_or_else(|| AuthError::ReauthRequired {
            reason: format!("no token at {}", self.token_path.display()),
        })?;

        if !force && !token.is_expired() {
            return Ok(token.access_token.clone());
        }

        let refreshed = self.refresh(token).await?;
        let access = refreshed.access_token.clone();
        *guard = Some(refreshed);
        Ok(access)
    }
}

#[async_trait]
impl TokenProvider for CredentialStore {
    async fn access_token(&self) -> Result<SecretString, AuthError> {
        self.current_token(false).await
    }

    async fn force_refresh(&self) -> Result<SecretString, AuthError> {
        self.current_token(true).await
    }
}

async fn consent_callback(
    State(tx): State<mpsc::Sender<HashMap<String, String>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    let _ = tx.send(params).await;
    Html("<html><body><h3>Calm Mail is authorized. You can close this tab.</h3></body></html>")
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Google consent URL with offline access so a refresh token is issued.
fn authorization_url(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    state: &str,
) -> Result<reqwest::Url, AuthError> {
    reqwest::Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", GMAIL_MODIFY_SCOPE),
            ("state", state),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| AuthError::Flow(format!("invalid auth_uri: {e}")))
}
