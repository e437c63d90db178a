//! EventSub subscription types and their wire descriptors.

use std::fmt;

use serde::Serialize;
use serde_json::json;

/// Event types this client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// A viewer redeemed a custom channel-point reward.
    ChannelPointsCustomRewardRedemptionAdd,
    /// Held automod messages. Registered at startup so a fresh WebSocket
    /// session always has one subscription and is not dropped by the server.
    AutomodMessageHold,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 2] = [
        SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd,
        SubscriptionKind::AutomodMessageHold,
    ];

    pub fn wire_type(&self) -> &'static str {
        match self {
            SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd => {
                "channel.channel_points_custom_reward_redemption.add"
            }
            SubscriptionKind::AutomodMessageHold => "automod.message.hold",
        }
    }

    pub fn version(&self) -> &'static str {
        "1"
    }

    pub fn from_wire_type(wire: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_type() == wire)
    }

    /// Subscription `condition` object for the given broadcaster.
    pub fn condition(&self, broadcaster_id: &str) -> serde_json::Value {
        match self {
            SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd => json!({
                "broadcaster_user_id": broadcaster_id,
            }),
            SubscriptionKind::AutomodMessageHold => json!({
                "broadcaster_user_id": broadcaster_id,
                "moderator_user_id": broadcaster_id,
            }),
        }
    }

    /// Request body for `POST /helix/eventsub/subscriptions` over a WebSocket session.
    pub fn create_request(&self, broadcaster_id: &str, session_id: &str) -> serde_json::Value {
        json!({
            "type": self.wire_type(),
            "version": self.version(),
            "condition": self.condition(broadcaster_id),
            "transport": {
                "method": "websocket",
                "session_id": session_id,
            },
        })
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_type())
    }
}

/// Whether the server has acknowledged a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    /// Registered locally, not yet acknowledged.
    NotSubscribed,
    /// No such subscription registered.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_types_round_trip() {
        for kind in SubscriptionKind::ALL {
            assert_eq!(SubscriptionKind::from_wire_type(kind.wire_type()), Some(kind));
        }
        assert_eq!(SubscriptionKind::from_wire_type("channel.follow"), None);
    }

    #[test]
    fn automod_condition_names_moderator() {
        let cond = SubscriptionKind::AutomodMessageHold.condition("42");
        assert_eq!(cond["broadcaster_user_id"], "42");
        assert_eq!(cond["moderator_user_id"], "42");

        let cond = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd.condition("42");
        assert_eq!(cond["broadcaster_user_id"], "42");
        assert!(cond.get("moderator_user_id").is_none());
    }

    #[test]
    fn create_request_uses_websocket_transport() {
        let body = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd.create_request("42", "sess");
        assert_eq!(body["type"], "channel.channel_points_custom_reward_redemption.add");
        assert_eq!(body["version"], "1");
        assert_eq!(body["transport"]["method"], "websocket");
        assert_eq!(body["transport"]["session_id"], "sess");
    }
}
