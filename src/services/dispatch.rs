//! Routes decoded EventSub messages to subscription callbacks.

use tracing::{debug, error, info, instrument, warn};

use super::subscriptions::SubscriptionRegistry;
use crate::error::AppResult;
use crate::json;
use crate::models::{ChannelPointRewardRedemption, EventSubMessage, SubscriptionKind};

/// What a single message amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// `session_welcome` with the new session id.
    SessionStarted(String),
    /// A callback was invoked.
    Delivered(SubscriptionKind),
    /// A notification nobody handles; logged and dropped.
    Dropped(String),
    /// The server revoked a subscription; it is pending again.
    Revoked(String),
    Keepalive,
    ReconnectRequested(Option<String>),
    Unknown(String),
}

#[derive(Clone)]
pub struct Dispatcher {
    subscriptions: SubscriptionRegistry,
}

impl Dispatcher {
    pub fn new(subscriptions: SubscriptionRegistry) -> Self {
        Self { subscriptions }
    }

    /// Parse one text frame and dispatch it.
    pub async fn handle_text(&self, text: &str) -> AppResult<Dispatched> {
        let root = json::parse(text).map_err(|e| {
            error!(error = %e, "failed to parse EventSub message");
            e
        })?;
        let message = EventSubMessage::from_json(&root).map_err(|e| {
            error!(error = %e, "malformed EventSub message");
            root.dump_to_log();
            e
        })?;
        Ok(self.dispatch(message).await)
    }

    #[instrument(skip(self, message), fields(message_type = %message.name()))]
    pub async fn dispatch(&self, message: EventSubMessage) -> Dispatched {
        match message {
            EventSubMessage::Welcome { session_id } => {
                info!(session_id = %session_id, "EventSub session welcome");
                Dispatched::SessionStarted(session_id)
            }
            EventSubMessage::Notification {
                subscription_type,
                event,
            } => self.notify(subscription_type, &event).await,
            EventSubMessage::Revocation {
                subscription_type,
                status,
            } => {
                warn!(subscription = %subscription_type, status = %status, "subscription revoked");
                if let Some(kind) = SubscriptionKind::from_wire_type(&subscription_type) {
                    self.subscriptions.mark_pending(kind).await;
                }
                Dispatched::Revoked(subscription_type)
            }
            EventSubMessage::Keepalive => {
                debug!("keepalive");
                Dispatched::Keepalive
            }
            EventSubMessage::Reconnect { reconnect_url } => {
                warn!(url = ?reconnect_url, "server requested reconnect");
                Dispatched::ReconnectRequested(reconnect_url)
            }
            EventSubMessage::Unknown { message_type } => {
                warn!(message_type = %message_type, "unknown EventSub message type");
                Dispatched::Unknown(message_type)
            }
        }
    }

    async fn notify(&self, subscription_type: String, event: &json::JsonValue) -> Dispatched {
        let Some(kind) = SubscriptionKind::from_wire_type(&subscription_type) else {
            warn!(subscription = %subscription_type, "notification for unsupported type");
            return Dispatched::Dropped(subscription_type);
        };
        let callback = self
            .subscriptions
            .get(kind)
            .await
            .and_then(|entry| entry.callback);
        let Some(callback) = callback else {
            info!(subscription = %kind, "no callback registered, dropping notification");
            return Dispatched::Dropped(subscription_type);
        };

        match kind {
            SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd => {
                match ChannelPointRewardRedemption::from_event(event) {
                    Ok(redemption) => {
                        info!(subscription = %kind, redemption_id = %redemption.id, "invoking callback");
                        callback(redemption);
                        Dispatched::Delivered(kind)
                    }
                    Err(e) => {
                        error!(subscription = %kind, error = %e, "bad redemption event");
                        Dispatched::Dropped(subscription_type)
                    }
                }
            }
            SubscriptionKind::AutomodMessageHold => {
                debug!(subscription = %kind, "automod events carry no redemption, dropping");
                Dispatched::Dropped(subscription_type)
            }
        }
    }
}
