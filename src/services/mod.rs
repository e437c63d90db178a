//! Business logic: subscriptions, dispatch, Helix calls and the session.

pub mod dispatch;
pub mod helix;
pub mod session;
pub mod subscriptions;

pub use dispatch::{Dispatched, Dispatcher};
pub use helix::HelixClient;
pub use session::Session;
pub use subscriptions::{EventSubSubscription, RedemptionCallback, SubscriptionRegistry};
