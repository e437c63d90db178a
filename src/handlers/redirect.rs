//! Local OAuth redirect listener: accept the browser's redirect, acknowledge
//! it and pull the authorization code out of the request line.

use tracing::{info, instrument, warn};

use crate::auth::{extract_code, ACK_RESPONSE};
use crate::error::{AppError, AppResult};
use crate::net::http::find_head_end;
use crate::net::{SocketRegistry, ACCEPTED_CONNECTION};

/// Registry name of the redirect listener socket.
pub const REDIRECT_LISTENER: &str = "listener";

const MAX_REDIRECT_REQUEST: usize = 4096;

/// Block until one connection reaches `listener`, answer it with the static
/// page and return the code it carried. The accepted connection is removed
/// whatever the outcome.
#[instrument(skip(registry))]
pub async fn wait_for_code(registry: &SocketRegistry, listener: &str) -> AppResult<String> {
    registry.accept(listener.into()).await?;
    let request = read_request(registry).await;

    if let Err(e) = registry
        .send(ACCEPTED_CONNECTION.into(), ACK_RESPONSE.as_bytes(), false)
        .await
    {
        warn!(error = %e, "failed to acknowledge redirect");
    }
    if let Err(e) = registry.remove(ACCEPTED_CONNECTION.into()).await {
        warn!(error = %e, "failed to remove redirect connection");
    }

    let request = request?;
    let code = extract_code(&request)?;
    info!(bytes = request.len(), "authorization code received");
    Ok(code)
}

async fn read_request(registry: &SocketRegistry) -> AppResult<String> {
    let mut request = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while find_head_end(&request).is_none() && request.len() < MAX_REDIRECT_REQUEST {
        let read = registry
            .receive(ACCEPTED_CONNECTION.into(), &mut buf, false)
            .await?;
        if read == 0 {
            break;
        }
        request.extend_from_slice(&buf[..read]);
    }
    if request.is_empty() {
        return Err(AppError::Session("redirect connection sent nothing".to_string()));
    }
    Ok(String::from_utf8_lossy(&request).into_owned())
}
