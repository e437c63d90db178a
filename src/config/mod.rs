//! Application configuration loaded from environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default OAuth scopes: chat read, automod management (keeps the EventSub session
/// alive via `automod.message.hold`), and redemption reads.
pub const DEFAULT_SCOPES: &str = "chat:read moderator:manage:automod channel:read:redemptions";

/// Client configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Twitch application client id (`CLIENT_ID`, required).
    pub client_id: String,
    /// Twitch application client secret (`CLIENT_SECRET`, required).
    pub client_secret: String,
    /// Loopback port the OAuth redirect listener binds (`REDIRECT_PORT`).
    pub redirect_port: u16,
    /// OAuth host serving `/oauth2/authorize` and `/oauth2/token`.
    pub auth_host: String,
    /// Helix API host (users, eventsub subscriptions).
    pub api_host: String,
    /// EventSub WebSocket host.
    pub eventsub_host: String,
    /// EventSub WebSocket request path.
    pub eventsub_path: String,
    /// Port used for auth, API and EventSub connections.
    pub https_port: u16,
    /// Whether outbound connections are wrapped in TLS. Only tests turn this off.
    pub use_tls: bool,
    /// Space separated OAuth scopes.
    pub scopes: String,
    /// Launch the platform browser on the authorize URL.
    pub open_browser: bool,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    /// Directory the log sink dumps into on shutdown.
    pub log_dir: PathBuf,
    /// Interval between token expiry checks.
    pub check_interval: Duration,
    /// Delay before the WebSocket unit reconnects after losing its connection.
    pub reconnect_delay: Duration,
    /// Maximum number of live registry sockets.
    pub max_sockets: usize,
}

impl Config {
    /// Configuration with the given credentials and Twitch production defaults.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_port: 3000,
            auth_host: "id.twitch.tv".to_string(),
            api_host: "api.twitch.tv".to_string(),
            eventsub_host: "eventsub.wss.twitch.tv".to_string(),
            eventsub_path: "/ws".to_string(),
            https_port: 443,
            use_tls: true,
            scopes: DEFAULT_SCOPES.to_string(),
            open_browser: true,
            log_level: "info".to_string(),
            log_dir: PathBuf::from("Logs"),
            check_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            max_sockets: 16,
        }
    }

    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let client_id = required("CLIENT_ID")?;
        let client_secret = required("CLIENT_SECRET")?;
        let mut config = Self::new(client_id, client_secret);

        if let Some(port) = parsed::<u16>("REDIRECT_PORT")? {
            config.redirect_port = port;
        }
        if let Ok(host) = std::env::var("AUTH_HOST") {
            config.auth_host = host;
        }
        if let Ok(host) = std::env::var("API_HOST") {
            config.api_host = host;
        }
        if let Ok(host) = std::env::var("EVENTSUB_HOST") {
            config.eventsub_host = host;
        }
        if let Ok(path) = std::env::var("EVENTSUB_PATH") {
            config.eventsub_path = path;
        }
        if let Some(port) = parsed::<u16>("HTTPS_PORT")? {
            config.https_port = port;
        }
        if let Some(tls) = flag("USE_TLS")? {
            config.use_tls = tls;
        }
        if let Ok(scopes) = std::env::var("OAUTH_SCOPES") {
            config.scopes = scopes;
        }
        if let Some(open) = flag("OPEN_BROWSER")? {
            config.open_browser = open;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parsed::<u64>("CHECK_INTERVAL_SECS")? {
            config.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>("RECONNECT_DELAY_SECS")? {
            config.reconnect_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Point auth, API and EventSub traffic at one host (plaintext test servers).
    pub fn with_local_endpoints(mut self, host: &str, port: u16) -> Self {
        self.auth_host = host.to_string();
        self.api_host = host.to_string();
        self.eventsub_host = host.to_string();
        self.https_port = port;
        self.use_tls = false;
        self
    }

    pub fn with_redirect_port(mut self, port: u16) -> Self {
        self.redirect_port = port;
        self
    }

    pub fn with_open_browser(mut self, open: bool) -> Self {
        self.open_browser = open;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Redirect URI registered with the Twitch application.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.redirect_port)
    }
}

fn required(name: &'static str) -> Result<String, ConfigLoadError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigLoadError::MissingVar(name)),
    }
}

fn parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigLoadError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::Invalid(name)),
        Err(_) => Ok(None),
    }
}

fn flag(name: &'static str) -> Result<Option<bool>, ConfigLoadError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigLoadError::Invalid(name)),
        },
        Err(_) => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Environment variable {0} not found")]
    MissingVar(&'static str),
    #[error("Invalid value for {0}")]
    Invalid(&'static str),
}
