//! Token endpoint and Helix API calls, each on its own short-lived registry socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::auth::TokenSet;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::json::{self, JsonValue};
use crate::models::SubscriptionKind;
use crate::net::http::{encode_component, exchange, HttpRequest, HttpResponse};
use crate::net::SocketRegistry;

#[derive(Clone)]
pub struct HelixClient {
    registry: SocketRegistry,
    config: Arc<Config>,
    counter: Arc<AtomicUsize>,
}

impl HelixClient {
    pub fn new(registry: SocketRegistry, config: Arc<Config>) -> Self {
        Self {
            registry,
            config,
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registry name for the next request; concurrent requests never share one.
    fn socket_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    async fn send(&self, prefix: &str, request: &HttpRequest) -> AppResult<HttpResponse> {
        let socket = self.socket_name(prefix);
        exchange(
            &self.registry,
            &socket,
            self.config.https_port,
            self.config.use_tls,
            request,
        )
        .await
    }

    async fn token_request(&self, pairs: &[(&str, &str)], previous_refresh: Option<&str>) -> AppResult<TokenSet> {
        let request = HttpRequest::post(&self.config.auth_host, "/oauth2/token").form(pairs);
        let response = self.send("oauth", &request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        TokenSet::parse(&response.body_text(), previous_refresh)
    }

    /// Exchange an authorization code for tokens.
    #[instrument(skip(self, code))]
    pub async fn exchange_code(&self, code: &str) -> AppResult<TokenSet> {
        let redirect_uri = self.config.redirect_uri();
        let tokens = self
            .token_request(
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                    ("code", code),
                    ("grant_type", "authorization_code"),
                    ("redirect_uri", redirect_uri.as_str()),
                ],
                None,
            )
            .await?;
        info!(expires_in = tokens.expires_in.as_secs(), scopes = tokens.scopes.len(), "authorization code exchanged");
        Ok(tokens)
    }

    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenSet> {
        let tokens = self
            .token_request(
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
                Some(refresh_token),
            )
            .await?;
        info!(expires_in = tokens.expires_in.as_secs(), "access token refreshed");
        Ok(tokens)
    }

    fn api_request(&self, request: HttpRequest, access_token: &str) -> HttpRequest {
        request
            .header("Client-ID", &self.config.client_id)
            .bearer(access_token)
    }

    /// Id of the user the access token belongs to (`data[0].id`).
    #[instrument(skip(self, access_token))]
    pub async fn get_user_id(&self, access_token: &str) -> AppResult<String> {
        let request = self.api_request(HttpRequest::get(&self.config.api_host, "/helix/users"), access_token);
        let response = self.send("helix", &request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        let root = json::parse(&response.body_text())?;
        let id = first_data_id(&root).ok_or_else(|| AppError::MissingField("data[0].id".to_string()))?;
        debug!(user_id = %id, "resolved broadcaster id");
        Ok(id)
    }

    /// Create one subscription on a WebSocket session. Only `202 Accepted`
    /// counts; the returned id is `data[0].id` when present.
    #[instrument(skip(self, access_token, broadcaster_id, session_id), fields(subscription = %kind))]
    pub async fn create_subscription(
        &self,
        access_token: &str,
        kind: SubscriptionKind,
        broadcaster_id: &str,
        session_id: &str,
    ) -> AppResult<Option<String>> {
        let body = kind.create_request(broadcaster_id, session_id);
        let request = self
            .api_request(
                HttpRequest::post(&self.config.api_host, "/helix/eventsub/subscriptions"),
                access_token,
            )
            .json(&body);
        let response = self.send("helix", &request).await?;
        if response.status != 202 {
            warn!(status = response.status, body = %response.body_text(), "subscription not accepted");
            return Err(response.into_error());
        }
        let id = json::parse(&response.body_text())
            .ok()
            .and_then(|root| first_data_id(&root));
        info!(subscription_id = ?id, "subscription accepted");
        Ok(id)
    }

    #[instrument(skip(self, access_token))]
    pub async fn delete_subscription(&self, access_token: &str, subscription_id: &str) -> AppResult<()> {
        let path = format!("/helix/eventsub/subscriptions?id={}", encode_component(subscription_id));
        let request = self.api_request(HttpRequest::delete(&self.config.api_host, &path), access_token);
        let response = self.send("helix", &request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        info!("subscription deleted");
        Ok(())
    }
}

fn first_data_id(root: &JsonValue) -> Option<String> {
    root.get("data")
        .and_then(|data| data.index(0))
        .and_then(|first| first.get("id"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}
