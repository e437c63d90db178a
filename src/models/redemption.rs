//! Channel-point reward redemption, as delivered to callbacks.

use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::json::JsonValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reward {
    pub id: String,
    pub title: String,
    pub cost: u64,
    pub prompt: String,
}

/// One `channel.channel_points_custom_reward_redemption.add` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelPointRewardRedemption {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    /// RFC 3339 timestamp as sent by the server.
    pub redeemed_at: String,
    pub reward: Reward,
    /// `unfulfilled`, `fulfilled` or `canceled`.
    pub status: String,
    /// Empty when the reward takes no input.
    pub user_input: String,
}

fn text(obj: &JsonValue, key: &str) -> String {
    obj.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

impl ChannelPointRewardRedemption {
    /// Build from the notification's `payload.event` object. Only `id` is
    /// required; other missing fields are left empty.
    pub fn from_event(event: &JsonValue) -> AppResult<Self> {
        if event.as_object().is_none() {
            return Err(AppError::MissingField(format!(
                "event must be an object, got {}",
                event.kind()
            )));
        }
        let id = event
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| AppError::MissingField("event.id".to_string()))?
            .to_string();

        let reward = match event.get("reward") {
            Some(reward) => Reward {
                id: text(reward, "id"),
                title: text(reward, "title"),
                cost: reward
                    .get("cost")
                    .and_then(JsonValue::as_f64)
                    .filter(|c| *c >= 0.0)
                    .map(|c| c as u64)
                    .unwrap_or_default(),
                prompt: text(reward, "prompt"),
            },
            None => Reward::default(),
        };

        Ok(Self {
            id,
            user_id: text(event, "user_id"),
            user_login: text(event, "user_login"),
            user_name: text(event, "user_name"),
            broadcaster_user_id: text(event, "broadcaster_user_id"),
            broadcaster_user_login: text(event, "broadcaster_user_login"),
            broadcaster_user_name: text(event, "broadcaster_user_name"),
            redeemed_at: text(event, "redeemed_at"),
            reward,
            status: text(event, "status"),
            user_input: text(event, "user_input"),
        })
    }

    /// One-line description for logs and the control shell.
    pub fn summary(&self) -> String {
        format!(
            "Redemption ID: {}, User: {}, Reward: {}, Prompt: {}, User Input: {}, Status: {}",
            self.id, self.user_name, self.reward.title, self.reward.prompt, self.user_input, self.status
        )
    }
}
