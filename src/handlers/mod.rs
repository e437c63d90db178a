//! Long-running socket handlers: the OAuth redirect listener and the
//! EventSub WebSocket unit.

pub mod eventsub;
pub mod redirect;

pub use redirect::{wait_for_code, REDIRECT_LISTENER};
