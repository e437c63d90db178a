//! Entry point: load config, install logging, run the session until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use twitchsub::{
    AuthState, ChannelPointRewardRedemption, Config, Controller, LogSink, LogSinkLayer,
    RedemptionCallback, SubscriptionKind,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let sink = LogSink::new();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogSinkLayer::new(sink.clone()))
        .init();

    let log_dir = config.log_dir.clone();
    let controller = Controller::new(config)?;

    let on_redemption: RedemptionCallback = Arc::new(|redemption: ChannelPointRewardRedemption| {
        tracing::info!(target: "redemptions", "{}", redemption.summary());
    });
    controller
        .subscribe(
            SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd,
            Some(on_redemption),
        )
        .await;

    controller.start().await;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        authenticated = wait_for_authentication(&controller) => {
            if authenticated {
                controller.enable_websocket(true).await;
                tokio::signal::ctrl_c().await?;
                tracing::info!("interrupted");
            } else {
                tracing::error!(error = ?controller.last_error().await, "session ended without authentication");
            }
        }
    }
    controller.stop().await;

    let written = sink.dump_all_to_file(&log_dir)?;
    tracing::info!(files = written, dir = %log_dir.display(), "logs written");
    Ok(())
}

/// True once authenticated; false if the supervisory unit gave up first.
async fn wait_for_authentication(controller: &Controller) -> bool {
    loop {
        if controller.auth_state().await == AuthState::Authenticated {
            return true;
        }
        if !controller.is_running().await {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
