//! WebSocket unit: connect to EventSub, feed text frames to the session and
//! reconnect when the connection is lost.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::services::dispatch::Dispatched;
use crate::services::session::Session;
use crate::ws::Inbound;

const AUTH_POLL: Duration = Duration::from_millis(100);

/// Why a connection's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    Lost,
}

/// Run until `cancel` fires. The connection is closed with a close frame on the way out.
pub async fn run(session: Session, cancel: CancellationToken) {
    info!("websocket unit started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if session.auth_state().await != AuthState::Authenticated {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(AUTH_POLL) => continue,
            }
        }

        let exit = match session.connect_websocket().await {
            Ok(()) => receive_loop(&session, &cancel).await,
            Err(e) => {
                warn!(error = %e, "eventsub connect failed");
                LoopExit::Lost
            }
        };
        if exit == LoopExit::Cancelled {
            break;
        }
        session.websocket_lost().await;

        let delay = session.config().reconnect_delay;
        info!(delay_ms = delay.as_millis() as u64, "reconnecting to eventsub");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    session.ws().close().await;
    session.websocket_lost().await;
    info!("websocket unit stopped");
}

async fn receive_loop(session: &Session, cancel: &CancellationToken) -> LoopExit {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Cancelled,
            inbound = session.ws().receive() => inbound,
        };
        match inbound {
            Ok(Inbound::Text(text)) => {
                match session.handle_text(&text).await {
                    Ok(Dispatched::ReconnectRequested(_)) => return LoopExit::Lost,
                    Ok(outcome) => debug!(outcome = ?outcome, "frame handled"),
                    Err(e) => warn!(error = %e, "frame dropped"),
                }
                let created = session.resubscribe().await;
                if created > 0 {
                    info!(created, "subscriptions acknowledged");
                }
            }
            Ok(Inbound::Empty) => {}
            Ok(Inbound::Closed) => return LoopExit::Lost,
            Err(e) => {
                warn!(error = %e, "eventsub connection failed");
                return LoopExit::Lost;
            }
        }
    }
}
