//! Control surface: start and stop the supervisory and WebSocket units,
//! manage subscriptions and report state.

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::AuthState;
use crate::config::Config;
use crate::error::AppResult;
use crate::handlers::eventsub;
use crate::models::{SubscriptionKind, SubscriptionStatus};
use crate::services::{RedemptionCallback, Session};
use crate::ws::WsState;

/// A spawned task and the token that stops it.
struct Unit {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Unit {
    fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        Self { cancel, handle }
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel and wait for the task to finish.
    async fn stop(self, name: &str) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(unit = name, error = %e, "unit task failed");
        }
        info!(unit = name, "unit stopped");
    }
}

pub struct Controller {
    session: Session,
    supervisor: Mutex<Option<Unit>>,
    websocket: Mutex<Option<Unit>>,
}

impl Controller {
    pub fn new(config: Config) -> AppResult<Self> {
        Ok(Self::with_session(Session::new(config)?))
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session,
            supervisor: Mutex::new(None),
            websocket: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Start the supervisory unit: initialize, authenticate, then check token
    /// expiry every `check_interval`.
    pub async fn start(&self) {
        let mut slot = self.supervisor.lock().await;
        if slot.as_ref().is_some_and(Unit::is_running) {
            warn!("session already running");
            return;
        }
        let session = self.session.clone();
        *slot = Some(Unit::spawn(move |cancel| supervise(session, cancel)));
        info!("session started");
    }

    /// Stop both units, wait for them, and close every socket.
    pub async fn stop(&self) {
        let websocket = self.websocket.lock().await.take();
        if let Some(unit) = websocket {
            unit.stop("websocket").await;
        }
        let supervisor = self.supervisor.lock().await.take();
        if let Some(unit) = supervisor {
            unit.stop("supervisor").await;
        }
        self.session.shutdown().await;
    }

    pub async fn enable_websocket(&self, enabled: bool) {
        let mut slot = self.websocket.lock().await;
        if enabled {
            if slot.as_ref().is_some_and(Unit::is_running) {
                warn!("websocket already running");
                return;
            }
            let session = self.session.clone();
            *slot = Some(Unit::spawn(move |cancel| eventsub::run(session, cancel)));
            info!("websocket enabled");
        } else if let Some(unit) = slot.take() {
            unit.stop("websocket").await;
        }
    }

    pub async fn subscribe(&self, kind: SubscriptionKind, callback: Option<RedemptionCallback>) {
        self.session.subscriptions().subscribe(kind, callback).await;
    }

    pub async fn unsubscribe(&self, kind: SubscriptionKind) -> bool {
        self.session.unsubscribe(kind).await
    }

    pub async fn is_subscribed(&self, kind: SubscriptionKind) -> SubscriptionStatus {
        self.session.subscriptions().status(kind).await
    }

    pub async fn auth_state(&self) -> AuthState {
        self.session.auth_state().await
    }

    pub async fn ws_state(&self) -> WsState {
        self.session.ws_state().await
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.as_ref().is_some_and(Unit::is_running)
    }

    pub async fn is_websocket_enabled(&self) -> bool {
        self.websocket.lock().await.as_ref().is_some_and(Unit::is_running)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.session.last_error().await
    }
}

async fn supervise(session: Session, cancel: CancellationToken) {
    let authenticated = tokio::select! {
        _ = cancel.cancelled() => return,
        result = session.authenticate() => result,
    };
    if authenticated.is_err() {
        // Already logged and recorded by the session.
        return;
    }

    let mut ticker = tokio::time::interval(session.config().check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = session.check_expiry().await {
                    warn!(error = %e, "expiry check failed");
                    session.record_error(&e).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelPointRewardRedemption;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller() -> Controller {
        let config = Config::new("cid", "secret")
            .with_local_endpoints("127.0.0.1", 9)
            .with_redirect_port(0)
            .with_open_browser(false);
        Controller::new(config).unwrap()
    }

    #[tokio::test]
    async fn start_and_stop_join_the_supervisor() {
        let controller = controller();
        assert!(!controller.is_running().await);
        controller.start().await;
        assert!(controller.is_running().await);
        controller.start().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.auth_state().await, AuthState::AwaitingRedirect);

        controller.stop().await;
        assert!(!controller.is_running().await);
        assert!(controller.session().registry().is_empty().await);
    }

    #[tokio::test]
    async fn websocket_unit_waits_for_authentication() {
        let controller = controller();
        controller.enable_websocket(true).await;
        assert!(controller.is_websocket_enabled().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.ws_state().await, WsState::Disconnected);

        controller.enable_websocket(false).await;
        assert!(!controller.is_websocket_enabled().await);
    }

    #[tokio::test]
    async fn subscription_surface() {
        let controller = controller();
        let kind = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd;
        assert_eq!(controller.is_subscribed(kind).await, SubscriptionStatus::Unknown);

        let callback: RedemptionCallback = Arc::new(|_: ChannelPointRewardRedemption| {});
        controller.subscribe(kind, Some(callback)).await;
        assert_eq!(controller.is_subscribed(kind).await, SubscriptionStatus::NotSubscribed);

        assert!(controller.unsubscribe(kind).await);
        assert_eq!(controller.is_subscribed(kind).await, SubscriptionStatus::Unknown);
        assert!(controller.last_error().await.is_none());
    }
}
