use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::api::{IdToken, TokenProvider};
use crate::storage::{self, Account, Token};

pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
/// Upper bound on a server-supplied `expires_in`.
const MAX_TOKEN_LIFETIME_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub token_url: String,
    pub refresh_skew: Duration,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            token_url: DEFAULT_TOKEN_URL.into(),
            refresh_skew: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Who an ID token was issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub display_name: String,
    pub avatar_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub account: Account,
    pub token: TokenDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDetails {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct Flow {
    cfg: Config,
    store: Arc<storage::Store>,
    client: Client,
}

impl Flow {
    pub fn new(store: Arc<storage::Store>, cfg: Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("auth: build http client")?;
        Ok(Self { cfg, store, client })
    }

    /// Exchanges a refresh token for an ID token and remembers the account.
    pub fn sign_in(&self, refresh_token: &str) -> Result<Session> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            bail!("auth: refresh token is required");
        }
        let token = refresh_token_request(&self.client, &self.cfg, refresh_token)?;
        let identity = decode_identity(&token.id_token)?;

        let mut account = Account {
            id: 0,
            uid: identity.uid,
            display_name: identity.display_name,
            avatar_url: identity.avatar_url,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        account.id = self.store.upsert_account(account.clone())?;
        persist_token(&self.store, account.id, &token)?;
        info!(uid = %account.uid, "signed in");

        Ok(Session { account, token })
    }

    pub fn resume(&self, account: Account, stored: Token) -> Result<Session> {
        if account.id == 0 {
            bail!("auth: account id required");
        }
        if stored.id_token.is_empty() || stored.refresh_token.is_empty() {
            bail!("auth: stored token incomplete");
        }
        Ok(Session {
            account,
            token: TokenDetails {
                id_token: stored.id_token,
                refresh_token: stored.refresh_token,
                expires_at: stored.expires_at,
            },
        })
    }

    /// A provider that serves the stored ID token, refreshing it first when
    /// it is within the configured skew of expiring.
    pub fn token_provider(&self, account_id: i64) -> Arc<dyn TokenProvider> {
        Arc::new(StoreTokenSource {
            cfg: self.cfg.clone(),
            store: self.store.clone(),
            client: self.client.clone(),
            account_id,
            refresh_lock: Mutex::new(()),
        })
    }
}

struct StoreTokenSource {
    cfg: Config,
    store: Arc<storage::Store>,
    client: Client,
    account_id: i64,
    refresh_lock: Mutex<()>,
}

impl TokenProvider for StoreTokenSource {
    fn token(&self) -> Result<IdToken> {
        let _guard = self.refresh_lock.lock();
        let stored = self
            .store
            .get_token(self.account_id)?
            .ok_or_else(|| anyhow!("auth: token not found"))?;

        if !needs_refresh(stored.expires_at, self.cfg.refresh_skew, Utc::now()) {
            return Ok(IdToken {
                token: stored.id_token,
                expires_at: Some(stored.expires_at.into()),
            });
        }

        debug!(account_id = self.account_id, "refreshing id token");
        let fresh = refresh_token_request(&self.client, &self.cfg, &stored.refresh_token)?;
        persist_token(&self.store, self.account_id, &fresh)?;
        Ok(IdToken {
            token: fresh.id_token,
            expires_at: Some(fresh.expires_at.into()),
        })
    }
}

/// Serves one fixed bearer token, for development backends.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Result<IdToken> {
        Ok(IdToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

fn needs_refresh(expires_at: DateTime<Utc>, skew: Duration, now: DateTime<Utc>) -> bool {
    let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::seconds(0));
    expires_at - skew <= now
}

fn persist_token(store: &storage::Store, account_id: i64, token: &TokenDetails) -> Result<()> {
    store.upsert_token(Token {
        account_id,
        id_token: token.id_token.clone(),
        refresh_token: token.refresh_token.clone(),
        expires_at: token.expires_at,
    })
}

fn refresh_token_request(client: &Client, cfg: &Config, refresh_token: &str) -> Result<TokenDetails> {
    if cfg.api_key.trim().is_empty() {
        bail!("auth: api key is required to refresh tokens");
    }
    let mut url = Url::parse(&cfg.token_url)
        .with_context(|| format!("auth: invalid token url {}", cfg.token_url))?;
    url.query_pairs_mut().append_pair("key", cfg.api_key.trim());

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    let resp = client
        .post(url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .form(&form)
        .send()
        .context("auth: refresh token request")?;
    if !resp.status().is_success() {
        let body = resp.text().unwrap_or_default();
        if let Ok(err) = serde_json::from_str::<TokenError>(&body) {
            bail!("auth: refresh failed: {}", err);
        }
        bail!("auth: refresh failed: {}", body);
    }

    let payload: TokenResponse = resp.json().context("auth: decode refresh response")?;
    token_details(payload, refresh_token, Utc::now())
}

fn token_details(
    payload: TokenResponse,
    current_refresh: &str,
    now: DateTime<Utc>,
) -> Result<TokenDetails> {
    if payload.id_token.is_empty() {
        bail!("auth: missing id token");
    }
    let expires_in = match payload.expires_in.map(Seconds::value).transpose()? {
        Some(0) | None => DEFAULT_TOKEN_LIFETIME_SECS,
        Some(secs) => i64::try_from(secs)
            .unwrap_or(i64::MAX)
            .min(MAX_TOKEN_LIFETIME_SECS),
    };
    let refresh_token = if payload.refresh_token.is_empty() {
        current_refresh.to_string()
    } else {
        payload.refresh_token
    };
    Ok(TokenDetails {
        id_token: payload.id_token,
        refresh_token,
        expires_at: now
            .checked_add_signed(chrono::Duration::seconds(expires_in))
            .ok_or_else(|| anyhow!("auth: token expiry out of range"))?,
    })
}

/// Reads the identity claims from an ID token's payload segment. The
/// signature is not checked; the backend does that.
pub fn decode_identity(id_token: &str) -> Result<Identity> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow!("auth: malformed id token"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("auth: decode id token payload")?;
    let claims: Claims = serde_json::from_slice(&bytes).context("auth: parse id token claims")?;

    let uid = claims
        .user_id
        .or(claims.sub)
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| anyhow!("auth: id token has no user id"))?;
    Ok(Identity {
        display_name: claims.name.unwrap_or_else(|| uid.clone()),
        avatar_url: claims.picture.unwrap_or_default(),
        expires_at: claims.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single()),
        uid,
    })
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<Seconds>,
}

/// The token endpoint sends `expires_in` as a decimal string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(u64),
    Text(String),
}

impl Seconds {
    fn value(self) -> Result<u64> {
        match self {
            Seconds::Number(secs) => Ok(secs),
            Seconds::Text(text) => text
                .trim()
                .parse()
                .with_context(|| format!("auth: invalid expires_in {text:?}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: TokenErrorBody,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let TokenErrorBody { message, status } = &self.error;
        match (message.is_empty(), status.is_empty()) {
            (true, true) => write!(f, "unknown token error"),
            (false, true) => write!(f, "{message}"),
            (true, false) => write!(f, "{status}"),
            (false, false) => write!(f, "{message} ({status})"),
        }
    }
}
