//! OAuth 2.0 for the Drive API.
//!
//! Tokens are stored in `token.json` using the same field names as Google's
//! Python client (`token`, `refresh_token`, `token_uri`, `client_id`,
//! `client_secret`, `scopes`, `expiry`), so an existing token file keeps
//! working. When no usable token exists, [`run_installed_flow`] runs the
//! installed-app loopback flow with PKCE: it prints the consent URL, waits
//! for Google to redirect to a one-shot local listener and exchanges the
//! code.

use anyhow::{bail, Context, Result};
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::{Config, DriveConfig};

/// Tokens this close to expiry are treated as expired.
pub const EXPIRY_SKEW_SECS: i64 = 60;
/// Lifetime assumed for an access token granted without `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth client from a Google `credentials.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read OAuth client file {} (download it from the Google Cloud console)",
                path.display()
            )
        })?;
        Self::parse(&raw).with_context(|| format!("invalid OAuth client file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_str(raw)?;
        file.installed
            .or(file.web)
            .context("expected an \"installed\" or \"web\" client section")
    }
}

/// Contents of `token.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// A token without an expiry never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now + ChronoDuration::seconds(EXPIRY_SKEW_SECS) >= expiry,
            None => false,
        }
    }

    pub fn covers_scopes(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|s| self.scopes.contains(s))
    }

    pub fn is_valid(&self, wanted: &[String], now: DateTime<Utc>) -> bool {
        self.token.is_some() && !self.is_expired(now) && self.covers_scopes(wanted)
    }

    pub fn status(&self, wanted: &[String], now: DateTime<Utc>) -> TokenStatus {
        if !self.covers_scopes(wanted) {
            TokenStatus::InsufficientScopes
        } else if self.token.is_none() || self.is_expired(now) {
            if self.refresh_token.is_some() {
                TokenStatus::Refreshable
            } else {
                TokenStatus::Expired
            }
        } else {
            TokenStatus::Valid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Missing,
    Valid,
    /// Expired but carries a refresh token.
    Refreshable,
    Expired,
    InsufficientScopes,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Missing => "MISSING",
            TokenStatus::Valid => "VALID",
            TokenStatus::Refreshable => "EXPIRED (refreshable)",
            TokenStatus::Expired => "EXPIRED",
            TokenStatus::InsufficientScopes => "SCOPES CHANGED",
        }
    }
}

pub fn load_token(path: &Path) -> Result<Option<StoredToken>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    let token = serde_json::from_str(&raw)
        .with_context(|| format!("invalid token file {}", path.display()))?;
    Ok(Some(token))
}

pub fn save_token(path: &Path, token: &StoredToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string(token)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write token file {}", path.display()))
}

/// Token status for `dchat status`, without touching the network.
pub fn token_status(drive: &DriveConfig) -> TokenStatus {
    match load_token(&drive.token_path) {
        Ok(Some(token)) => token.status(&drive.scopes, Utc::now()),
        Ok(None) => TokenStatus::Missing,
        Err(e) => {
            tracing::warn!("{e:#}");
            TokenStatus::Expired
        }
    }
}

fn http_client(drive: &DriveConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(drive.timeout_secs))
        .build()?)
}

/// Produce a usable token, refreshing or re-consenting as needed, and
/// persist it to `drive.token_path`.
pub async fn authorize(config: &Config) -> Result<StoredToken> {
    let drive = &config.drive;
    let http = http_client(drive)?;

    if let Some(stored) = load_token(&drive.token_path)? {
        if stored.is_valid(&drive.scopes, Utc::now()) {
            return Ok(stored);
        }
        if stored.covers_scopes(&drive.scopes) && stored.refresh_token.is_some() {
            match refresh(&http, &stored).await {
                Ok(fresh) => {
                    save_token(&drive.token_path, &fresh)?;
                    return Ok(fresh);
                }
                Err(e) => tracing::warn!("token refresh failed, starting a new consent: {e:#}"),
            }
        }
    }

    let secrets = ClientSecrets::load(&drive.credentials_path)?;
    let token = run_installed_flow(&http, &secrets, &drive.scopes).await?;
    save_token(&drive.token_path, &token)?;
    Ok(token)
}

/// RFC 7636 S256 code challenge.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn consent_url(
    secrets: &ClientSecrets,
    scopes: &[String],
    redirect_uri: &str,
    challenge: &str,
    state: &str,
) -> Result<reqwest::Url> {
    let scope = scopes.join(" ");
    let url = reqwest::Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .with_context(|| format!("invalid auth_uri {}", secrets.auth_uri))?;
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct Callback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn on_redirect(
    State(tx): State<mpsc::Sender<Callback>>,
    Query(callback): Query<Callback>,
) -> Html<&'static str> {
    let _ = tx.try_send(callback);
    Html("<p>The authentication flow has completed. You may close this window.</p>")
}

/// Installed-app flow on a loopback redirect.
pub async fn run_installed_flow(
    http: &reqwest::Client,
    secrets: &ClientSecrets,
    scopes: &[String],
) -> Result<StoredToken> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind the OAuth redirect listener")?;
    let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());

    let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let state = Uuid::new_v4().simple().to_string();
    let url = consent_url(
        secrets,
        scopes,
        &redirect_uri,
        &pkce_challenge(&verifier),
        &state,
    )?;

    println!("Please visit this URL to authorize this application:");
    println!("{}", url);

    let (tx, mut rx) = mpsc::channel::<Callback>(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = Router::new().route("/", get(on_redirect)).with_state(tx);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let callback = rx.recv().await.context("OAuth redirect listener closed")?;
    let _ = stop_tx.send(());
    let _ = server.await;

    if let Some(err) = callback.error {
        bail!("authorization was denied: {}", err);
    }
    if callback.state.as_deref() != Some(state.as_str()) {
        bail!("OAuth state mismatch; the redirect did not come from this request");
    }
    let code = callback.code.context("OAuth redirect carried no code")?;

    let response = http
        .post(&secrets.token_uri)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", verifier.as_str()),
        ])
        .send()
        .await
        .context("token exchange request failed")?;
    let grant = read_grant(response).await?;

    Ok(StoredToken {
        token: Some(grant.access_token),
        refresh_token: grant.refresh_token,
        token_uri: secrets.token_uri.clone(),
        client_id: secrets.client_id.clone(),
        client_secret: secrets.client_secret.clone(),
        scopes: grant
            .scope
            .map(|s| split_scopes(&s))
            .unwrap_or_else(|| scopes.to_vec()),
        expiry: Some(grant_expiry(grant.expires_in, Utc::now())),
    })
}

/// Exchange the refresh token for a new access token.
pub async fn refresh(http: &reqwest::Client, token: &StoredToken) -> Result<StoredToken> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .context("token has no refresh_token")?;

    let response = http
        .post(&token.token_uri)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
        ])
        .send()
        .await
        .context("token refresh request failed")?;
    let grant = read_grant(response).await?;

    Ok(apply_grant(token, grant, Utc::now()))
}

#[derive(Debug, Deserialize)]
struct Grant {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

async fn read_grant(response: reqwest::Response) -> Result<Grant> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("token endpoint error {}: {}", status, body);
    }
    Ok(response.json().await?)
}

fn apply_grant(previous: &StoredToken, grant: Grant, now: DateTime<Utc>) -> StoredToken {
    StoredToken {
        token: Some(grant.access_token),
        refresh_token: grant.refresh_token.or_else(|| previous.refresh_token.clone()),
        scopes: grant
            .scope
            .map(|s| split_scopes(&s))
            .unwrap_or_else(|| previous.scopes.clone()),
        expiry: Some(grant_expiry(grant.expires_in, now)),
        ..previous.clone()
    }
}

fn grant_expiry(expires_in: Option<i64>, now: DateTime<Utc>) -> DateTime<Utc> {
    now + ChronoDuration::seconds(expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
}

fn split_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Hands out bearer tokens, refreshing shortly before expiry.
pub struct TokenSource {
    http: reqwest::Client,
    token: Mutex<StoredToken>,
    persist_path: Option<PathBuf>,
}

impl TokenSource {
    pub fn new(token: StoredToken) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: Mutex::new(token),
            persist_path: None,
        }
    }

    /// Write refreshed tokens back to `path`.
    pub fn persist_to(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        self
    }

    pub async fn access_token(&self) -> Result<String> {
        let mut current = self.token.lock().await;
        if current.token.is_none() || current.is_expired(Utc::now()) {
            let fresh = refresh(&self.http, &current).await?;
            if let Some(path) = &self.persist_path {
                save_token(path, &fresh)?;
            }
            *current = fresh;
        }
        current.token.clone().context("token has no access token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expiry: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            token: Some("ya29.access".into()),
            refresh_token: Some("1//refresh".into()),
            token_uri: DEFAULT_TOKEN_URI.into(),
            client_id: "id.apps.googleusercontent.com".into(),
            client_secret: "secret".into(),
            scopes: vec![crate::config::DRIVE_READONLY_SCOPE.into()],
            expiry,
        }
    }

    fn scopes() -> Vec<String> {
        vec![crate::config::DRIVE_READONLY_SCOPE.to_string()]
    }

    #[test]
    fn pkce_challenge_is_unpadded_base64url_sha256() {
        // SHA-256 of the empty string.
        assert_eq!(pkce_challenge(""), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU");
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r7wW1gFWFOEjXk"),
            "bwWFMyPfdG9qreDhH2lmftFx_dFeLDalzcT1gb_j68g"
        );
    }

    #[test]
    fn token_near_expiry_is_expired() {
        let now = Utc::now();
        assert!(token(Some(now + ChronoDuration::seconds(30))).is_expired(now));
        assert!(!token(Some(now + ChronoDuration::seconds(600))).is_expired(now));
        assert!(!token(None).is_expired(now));
    }

    #[test]
    fn missing_scope_invalidates_token() {
        let now = Utc::now();
        let t = token(Some(now + ChronoDuration::hours(1)));
        assert!(t.is_valid(&scopes(), now));
        let wider = vec![
            crate::config::DRIVE_READONLY_SCOPE.to_string(),
            "https://www.googleapis.com/auth/drive.metadata".to_string(),
        ];
        assert!(!t.is_valid(&wider, now));
        assert_eq!(t.status(&wider, now), TokenStatus::InsufficientScopes);
    }

    #[test]
    fn expired_status_depends_on_refresh_token() {
        let now = Utc::now();
        let mut t = token(Some(now - ChronoDuration::hours(1)));
        assert_eq!(t.status(&scopes(), now), TokenStatus::Refreshable);
        t.refresh_token = None;
        assert_eq!(t.status(&scopes(), now), TokenStatus::Expired);
    }

    #[test]
    fn refresh_keeps_refresh_token_when_omitted() {
        let now = Utc::now();
        let old = token(Some(now - ChronoDuration::hours(1)));
        let grant = Grant {
            access_token: "ya29.new".into(),
            expires_in: Some(3599),
            refresh_token: None,
            scope: None,
        };
        let fresh = apply_grant(&old, grant, now);
        assert_eq!(fresh.token.as_deref(), Some("ya29.new"));
        assert_eq!(fresh.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(fresh.scopes, old.scopes);
        assert_eq!(fresh.expiry, Some(now + ChronoDuration::seconds(3599)));
    }

    #[test]
    fn grant_without_lifetime_still_expires() {
        let now = Utc::now();
        let old = token(Some(now - ChronoDuration::hours(1)));
        let grant = Grant {
            access_token: "ya29.new".into(),
            expires_in: None,
            refresh_token: None,
            scope: None,
        };
        let fresh = apply_grant(&old, grant, now);
        assert_eq!(
            fresh.expiry,
            Some(now + ChronoDuration::seconds(DEFAULT_TOKEN_LIFETIME_SECS))
        );
        assert!(fresh.is_expired(now + ChronoDuration::seconds(DEFAULT_TOKEN_LIFETIME_SECS)));
    }

    #[test]
    fn reads_python_token_file() {
        let raw = r#"{"token": "ya29.a0", "refresh_token": "1//0g", "token_uri": "https://oauth2.googleapis.com/token", "client_id": "x.apps.googleusercontent.com", "client_secret": "s", "scopes": ["https://www.googleapis.com/auth/drive.readonly"], "universe_domain": "googleapis.com", "account": "", "expiry": "2024-05-01T10:20:30.123456Z"}"#;
        let t: StoredToken = serde_json::from_str(raw).unwrap();
        assert_eq!(t.token.as_deref(), Some("ya29.a0"));
        assert!(t.expiry.is_some());
        assert!(t.covers_scopes(&scopes()));
    }

    #[test]
    fn token_file_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token.json");
        assert!(load_token(&path).unwrap().is_none());
        let t = token(Some(Utc::now()));
        save_token(&path, &t).unwrap();
        assert_eq!(load_token(&path).unwrap(), Some(t));
    }

    #[test]
    fn client_secrets_accepts_installed_and_web() {
        let installed = r#"{"installed":{"client_id":"a","client_secret":"b","auth_uri":"https://accounts.google.com/o/oauth2/auth","token_uri":"https://oauth2.googleapis.com/token","redirect_uris":["http://localhost"]}}"#;
        assert_eq!(ClientSecrets::parse(installed).unwrap().client_id, "a");
        let web = r#"{"web":{"client_id":"w","client_secret":"b"}}"#;
        let s = ClientSecrets::parse(web).unwrap();
        assert_eq!(s.client_id, "w");
        assert_eq!(s.token_uri, DEFAULT_TOKEN_URI);
        assert!(ClientSecrets::parse(r#"{"other":{}}"#).is_err());
    }

    #[test]
    fn consent_url_carries_pkce_and_offline_access() {
        let secrets = ClientSecrets::parse(r#"{"installed":{"client_id":"cid","client_secret":"s"}}"#)
            .unwrap();
        let url = consent_url(&secrets, &scopes(), "http://127.0.0.1:5555/", "chal", "st").unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["code_challenge"], "chal");
        assert_eq!(pairs["state"], "st");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["redirect_uri"], "http://127.0.0.1:5555/");
    }
}
