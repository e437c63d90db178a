//! Twitch EventSub client built with Rust.
//!
//! Runs the OAuth authorization-code flow against a loopback redirect
//! listener, keeps a TLS WebSocket to EventSub open, registers subscriptions
//! on each session and hands channel-point redemptions to callbacks.

pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod handlers;
pub mod json;
pub mod logging;
pub mod models;
pub mod net;
pub mod services;
pub mod ws;

pub use auth::AuthState;
pub use config::Config;
pub use control::Controller;
pub use error::{AppError, AppResult};
pub use logging::{LogSink, LogSinkLayer};
pub use models::{ChannelPointRewardRedemption, SubscriptionKind, SubscriptionStatus};
pub use services::{RedemptionCallback, Session};
