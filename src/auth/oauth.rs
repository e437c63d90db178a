//! OAuth token state: authorization code, token set and its lifetime.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, AppResult};
use crate::json::{self, JsonValue};

/// Refresh once the access token has less than this left.
pub const REFRESH_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    /// Authorize URL issued; waiting for the browser to hit the redirect listener.
    AwaitingRedirect,
    CodeReceived,
    Exchanging,
    Authenticated,
    Refreshing,
}

/// First four characters followed by `****`.
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}

/// Tokens from one successful exchange or refresh.
#[derive(Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub scopes: BTreeSet<String>,
    pub expires_in: Duration,
}

fn required_str(root: &JsonValue, key: &str) -> AppResult<String> {
    root.get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::MissingField(key.to_string()))
}

impl TokenSet {
    /// Read a token endpoint response. `previous_refresh` stands in for a
    /// missing `refresh_token`, which refresh responses may omit.
    pub fn from_json(root: &JsonValue, previous_refresh: Option<&str>) -> AppResult<Self> {
        let access_token = required_str(root, "access_token")?;
        let refresh_token = match (root.get("refresh_token").and_then(JsonValue::as_str), previous_refresh) {
            (Some(token), _) => token.to_string(),
            (None, Some(previous)) => previous.to_string(),
            (None, None) => return Err(AppError::MissingField("refresh_token".to_string())),
        };
        let expires_in = root
            .get("expires_in")
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| AppError::MissingField("expires_in".to_string()))?;
        let token_type = required_str(root, "token_type")?;
        let scopes = root
            .get("scope")
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            access_token,
            refresh_token,
            token_type,
            scopes,
            expires_in: Duration::from_secs_f64(expires_in.max(0.0)),
        })
    }

    pub fn parse(body: &str, previous_refresh: Option<&str>) -> AppResult<Self> {
        let root = json::parse(body)?;
        Self::from_json(&root, previous_refresh)
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &mask_secret(&self.access_token))
            .field("refresh_token", &mask_secret(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Client credentials plus the current code and tokens.
pub struct OAuthSession {
    client_id: String,
    client_secret: String,
    code: Option<String>,
    tokens: Option<TokenSet>,
    obtained_at: Option<Instant>,
}

impl OAuthSession {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            code: None,
            tokens: None,
            obtained_at: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    pub fn set_code(&mut self, code: String) {
        self.code = Some(code);
    }

    /// Take the authorization code; it can only be exchanged once.
    pub fn take_code(&mut self) -> Option<String> {
        self.code.take()
    }

    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }

    /// Replace the whole token set, starting its lifetime now.
    pub fn install(&mut self, tokens: TokenSet) {
        self.install_at(tokens, Instant::now());
    }

    pub fn install_at(&mut self, tokens: TokenSet, obtained_at: Instant) {
        self.tokens = Some(tokens);
        self.obtained_at = Some(obtained_at);
    }

    pub fn tokens(&self) -> Option<&TokenSet> {
        self.tokens.as_ref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.refresh_token.as_str())
    }

    /// Lifetime left at `now`; `None` without tokens.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        let tokens = self.tokens.as_ref()?;
        let obtained = self.obtained_at?;
        Some(tokens.expires_in.saturating_sub(now.saturating_duration_since(obtained)))
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    /// True when tokens exist and less than `threshold` of their lifetime is left.
    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        self.remaining().is_some_and(|left| left < threshold)
    }

    pub fn clear(&mut self) {
        self.code = None;
        self.tokens = None;
        self.obtained_at = None;
    }
}

impl fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSession")
            .field("client_id", &self.client_id)
            .field("client_secret", &mask_secret(&self.client_secret))
            .field("has_code", &self.code.is_some())
            .field("tokens", &self.tokens)
            .finish()
    }
}
