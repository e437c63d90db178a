//! Authorization-code redirect: the authorize URL, the code carried by the
//! browser's redirect request, and the page sent back to the browser.

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::net::http::encode_component;

/// Static page returned to the browser after the redirect.
pub const ACK_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
<html><body><h1>You can now close this window.</h1></body></html>";

const CODE_PREFIX: &str = "GET /?code=";

pub fn authorize_url(config: &Config) -> String {
    let scheme = if config.use_tls { "https" } else { "http" };
    format!(
        "{}://{}/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}",
        scheme,
        config.auth_host,
        encode_component(&config.client_id),
        encode_component(&config.redirect_uri()),
        encode_component(&config.scopes),
    )
}

/// Authorization code from a raw redirect request. The request must contain
/// `GET /?code=`; the code ends at the first `&` or space.
pub fn extract_code(request: &str) -> AppResult<String> {
    let start = request
        .find(CODE_PREFIX)
        .ok_or_else(|| AppError::Session("no OAuth code in redirect request".to_string()))?
        + CODE_PREFIX.len();
    let rest = &request[start..];
    let end = rest
        .find(|c: char| c == '&' || c == ' ' || c == '\r' || c == '\n')
        .unwrap_or(rest.len());
    let code = &rest[..end];
    if code.is_empty() {
        return Err(AppError::Session("empty OAuth code in redirect request".to_string()));
    }
    Ok(code.to_string())
}

/// Hand the URL to the platform opener. Failure is reported, not fatal.
pub fn open_browser(url: &str) -> AppResult<()> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else {
        std::process::Command::new("xdg-open")
    };
    match command.arg(url).spawn() {
        Ok(_) => {
            info!("opened browser for authorization");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "could not open browser; visit the authorize URL manually");
            Err(AppError::Io(e))
        }
    }
}
