//! Data models for EventSub messages, subscriptions and redemptions.

pub mod message;
pub mod redemption;
pub mod subscription;

pub use message::*;
pub use redemption::*;
pub use subscription::*;
