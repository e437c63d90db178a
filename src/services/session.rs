//! Session state machine: OAuth token lifecycle, broadcaster identity,
//! WebSocket session id and subscription (re)registration.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::{Dispatched, Dispatcher};
use super::helix::HelixClient;
use super::subscriptions::SubscriptionRegistry;
use crate::auth::{authorize_url, mask_secret, open_browser, AuthState, OAuthSession, REFRESH_THRESHOLD};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::handlers::redirect::{wait_for_code, REDIRECT_LISTENER};
use crate::models::SubscriptionKind;
use crate::net::{AddressFamily, SocketKind, SocketRegistry, SocketStatus};
use crate::ws::{WsClient, WsEndpoint, WsState};

/// Everything one client instance owns. Clones share all state.
#[derive(Clone)]
pub struct Session {
    config: Arc<Config>,
    registry: SocketRegistry,
    helix: HelixClient,
    subscriptions: SubscriptionRegistry,
    dispatcher: Dispatcher,
    oauth: Arc<Mutex<OAuthSession>>,
    auth_state: Arc<RwLock<AuthState>>,
    broadcaster_id: Arc<RwLock<Option<String>>>,
    ws_session_id: Arc<RwLock<Option<String>>>,
    ws: WsClient,
    last_error: Arc<RwLock<Option<String>>>,
}

impl Session {
    pub fn new(config: Config) -> AppResult<Self> {
        Self::with_subscriptions(config, SubscriptionRegistry::new())
    }

    pub fn with_subscriptions(config: Config, subscriptions: SubscriptionRegistry) -> AppResult<Self> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(AppError::Config("client id and secret are required".to_string()));
        }
        let config = Arc::new(config);
        let registry = SocketRegistry::new(config.max_sockets)?;
        let oauth = OAuthSession::new(config.client_id.clone(), config.client_secret.clone());
        Ok(Self {
            helix: HelixClient::new(registry.clone(), config.clone()),
            dispatcher: Dispatcher::new(subscriptions.clone()),
            ws: WsClient::new(registry.clone()),
            config,
            registry,
            subscriptions,
            oauth: Arc::new(Mutex::new(oauth)),
            auth_state: Arc::new(RwLock::new(AuthState::Unauthenticated)),
            broadcaster_id: Arc::new(RwLock::new(None)),
            ws_session_id: Arc::new(RwLock::new(None)),
            last_error: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn ws(&self) -> &WsClient {
        &self.ws
    }

    pub async fn ws_state(&self) -> WsState {
        self.ws.state().await
    }

    pub async fn auth_state(&self) -> AuthState {
        *self.auth_state.read().await
    }

    async fn set_auth_state(&self, state: AuthState) {
        let mut current = self.auth_state.write().await;
        if *current != state {
            debug!(from = ?*current, to = ?state, "auth state");
            *current = state;
        }
    }

    pub async fn broadcaster_id(&self) -> Option<String> {
        self.broadcaster_id.read().await.clone()
    }

    pub async fn ws_session_id(&self) -> Option<String> {
        self.ws_session_id.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.oauth.lock().await.access_token().map(str::to_string)
    }

    pub async fn remaining_lifetime(&self) -> Option<Duration> {
        self.oauth.lock().await.remaining()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn record_error(&self, err: &AppError) {
        *self.last_error.write().await = Some(err.to_string());
    }

    /// Create the redirect listener on `127.0.0.1:<redirect_port>`. A listener
    /// left over from an earlier run is replaced.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> AppResult<()> {
        if self.registry.contains(REDIRECT_LISTENER).await {
            self.registry.remove(REDIRECT_LISTENER.into()).await?;
        }
        self.registry
            .create(REDIRECT_LISTENER, SocketKind::Stream, AddressFamily::Ipv4)
            .await?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.redirect_port));
        let bound = match self.registry.bind(REDIRECT_LISTENER.into(), addr).await {
            Ok(()) => self.registry.listen(REDIRECT_LISTENER.into(), 1).await,
            Err(e) => Err(e),
        };
        if let Err(e) = bound {
            error!(addr = %addr, error = %e, "redirect listener unavailable");
            if let Err(e) = self.registry.remove(REDIRECT_LISTENER.into()).await {
                debug!(error = %e, "listener cleanup failed");
            }
            return Err(e);
        }
        info!(addr = %addr, "session initialized");
        Ok(())
    }

    /// Port the redirect listener accepts on, once it is listening.
    pub async fn redirect_port(&self) -> Option<u16> {
        if !self.registry.contains(REDIRECT_LISTENER).await
            || self.registry.status(REDIRECT_LISTENER.into()).await.ok()? != SocketStatus::Listening
        {
            return None;
        }
        self.registry
            .local_addr(REDIRECT_LISTENER.into())
            .await
            .ok()
            .flatten()
            .map(|addr| addr.port())
    }

    /// Full authorization-code flow. Any failure leaves the session
    /// `Unauthenticated` and is reported as a session error.
    #[instrument(skip(self))]
    pub async fn authenticate(&self) -> AppResult<()> {
        match self.run_authorization().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_auth_state(AuthState::Unauthenticated).await;
                error!(error = %e, "authentication failed");
                let err = AppError::Session(format!("authentication failed: {}", e));
                self.record_error(&err).await;
                Err(err)
            }
        }
    }

    async fn run_authorization(&self) -> AppResult<()> {
        if !self.registry.contains(REDIRECT_LISTENER).await {
            self.initialize().await?;
        }
        self.set_auth_state(AuthState::AwaitingRedirect).await;
        let url = authorize_url(&self.config);
        info!(url = %url, "waiting for authorization");
        if self.config.open_browser {
            // Reported inside; the URL is in the log either way.
            let _ = open_browser(&url);
        }

        let code = wait_for_code(&self.registry, REDIRECT_LISTENER).await?;
        self.oauth.lock().await.set_code(code);
        self.set_auth_state(AuthState::CodeReceived).await;
        self.exchange_code().await
    }

    /// Exchange the stored code for tokens, then resolve the broadcaster id.
    #[instrument(skip(self))]
    pub async fn exchange_code(&self) -> AppResult<()> {
        let code = self
            .oauth
            .lock()
            .await
            .take_code()
            .ok_or_else(|| AppError::Session("no authorization code to exchange".to_string()))?;
        self.set_auth_state(AuthState::Exchanging).await;

        let tokens = self.helix.exchange_code(&code).await?;
        let user_id = self.helix.get_user_id(&tokens.access_token).await?;
        info!(
            access_token = %mask_secret(&tokens.access_token),
            broadcaster_id = %user_id,
            "authenticated"
        );

        self.oauth.lock().await.install(tokens);
        *self.broadcaster_id.write().await = Some(user_id);
        *self.last_error.write().await = None;
        self.set_auth_state(AuthState::Authenticated).await;
        Ok(())
    }

    /// Refresh grant. Tokens are swapped only on success; state returns to
    /// `Authenticated` either way.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> AppResult<()> {
        let refresh_token = self
            .oauth
            .lock()
            .await
            .refresh_token()
            .map(str::to_string)
            .ok_or_else(|| AppError::Session("no refresh token".to_string()))?;
        self.set_auth_state(AuthState::Refreshing).await;

        let outcome = match self.helix.refresh_token(&refresh_token).await {
            Ok(tokens) => {
                self.oauth.lock().await.install(tokens);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, keeping current tokens");
                Err(e)
            }
        };
        self.set_auth_state(AuthState::Authenticated).await;
        outcome
    }

    /// One expiry check: refresh when less than five minutes remain.
    /// Returns whether a refresh was attempted and succeeded.
    pub async fn check_expiry(&self) -> AppResult<bool> {
        if self.auth_state().await != AuthState::Authenticated {
            return Ok(false);
        }
        let due = self.oauth.lock().await.needs_refresh(REFRESH_THRESHOLD);
        if !due {
            return Ok(false);
        }
        info!("access token close to expiry, refreshing");
        self.refresh().await?;
        Ok(true)
    }

    pub fn websocket_endpoint(&self) -> WsEndpoint {
        WsEndpoint::new(
            &self.config.eventsub_host,
            self.config.https_port,
            &self.config.eventsub_path,
            self.config.use_tls,
        )
    }

    /// Open the EventSub WebSocket. Any earlier session id is forgotten.
    pub async fn connect_websocket(&self) -> AppResult<()> {
        *self.ws_session_id.write().await = None;
        let mut endpoint = self.websocket_endpoint();
        if let Some(token) = self.access_token().await {
            endpoint = endpoint.header("Authorization", &format!("Bearer {}", token));
        }
        self.ws.connect(&endpoint).await
    }

    /// Bookkeeping after the WebSocket went away: the next session needs
    /// fresh subscriptions.
    pub async fn websocket_lost(&self) {
        if self.ws.state().await != WsState::Closed {
            self.ws.discard().await;
        }
        *self.ws_session_id.write().await = None;
        self.subscriptions.mark_all_pending().await;
    }

    /// Dispatch one text frame; a welcome stores the session id.
    pub async fn handle_text(&self, text: &str) -> AppResult<Dispatched> {
        let outcome = self.dispatcher.handle_text(text).await?;
        if let Dispatched::SessionStarted(id) = &outcome {
            *self.ws_session_id.write().await = Some(id.clone());
        }
        Ok(outcome)
    }

    /// Create every pending subscription on the current session. Returns the
    /// number acknowledged in this pass.
    pub async fn resubscribe(&self) -> usize {
        let (Some(token), Some(broadcaster), Some(session_id)) = (
            self.access_token().await,
            self.broadcaster_id().await,
            self.ws_session_id().await,
        ) else {
            return 0;
        };

        let mut acknowledged = 0;
        for kind in self.subscriptions.pending().await {
            match self
                .helix
                .create_subscription(&token, kind, &broadcaster, &session_id)
                .await
            {
                Ok(id) => {
                    if self.subscriptions.mark_subscribed(kind, id).await {
                        acknowledged += 1;
                    }
                }
                Err(e) => warn!(subscription = %kind, error = %e, "subscription request failed"),
            }
        }
        acknowledged
    }

    /// Drop `kind` locally and delete it server-side when it had an id.
    pub async fn unsubscribe(&self, kind: SubscriptionKind) -> bool {
        let Some(entry) = self.subscriptions.unsubscribe(kind).await else {
            return false;
        };
        if let (Some(id), Some(token)) = (entry.id, self.access_token().await) {
            if let Err(e) = self.helix.delete_subscription(&token, &id).await {
                warn!(subscription = %kind, error = %e, "server-side delete failed");
            }
        }
        true
    }

    /// Close the WebSocket and the redirect listener, then anything still open.
    pub async fn shutdown(&self) {
        self.ws.close().await;
        *self.ws_session_id.write().await = None;
        if self.registry.contains(REDIRECT_LISTENER).await {
            if let Err(e) = self.registry.remove(REDIRECT_LISTENER.into()).await {
                warn!(error = %e, "failed to remove redirect listener");
            }
        }
        let closed = self.registry.close_all().await;
        info!(closed, "session shut down");
    }
}
