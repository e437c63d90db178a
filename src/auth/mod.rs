//! Authentication: OAuth authorization-code flow and token lifecycle.

mod oauth;
mod redirect;

pub use oauth::{mask_secret, AuthState, OAuthSession, TokenSet, REFRESH_THRESHOLD};
pub use redirect::{authorize_url, extract_code, open_browser, ACK_RESPONSE};
