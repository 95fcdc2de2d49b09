//! OTP Number Bot - Main entry point.

use anyhow::Context;
use otp_bot::config::Config;
use otp_bot::error::AppResult;
use otp_bot::messenger::{MessageReceiver, SignalClient, SignalNotifier};
use otp_bot::{build_handlers, ChatDispatcher};
use otp_core::OtpEngine;
use std::sync::Arc;
use telephony_client::TwilioClient;
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.bot.log_level);

    info!("Starting OTP Number Bot...");

    // Initialize clients
    let provider = Arc::new(
        TwilioClient::new(
            &config.telephony.api_url,
            &config.telephony.lookup_url,
            config.telephony.timeout,
        )
        .context("Failed to create telephony client")?,
    );

    let signal = SignalClient::new(
        &config.signal.service_url,
        &config.signal.phone_number,
        config.signal.timeout,
    )
    .context("Failed to create Signal client")?;

    let notifier = Arc::new(SignalNotifier::new(
        signal.clone(),
        config.engine.admin_ids.clone(),
        config.engine.broadcast_target.clone(),
    ));

    if !signal.health_check().await {
        error!("Signal API not reachable at {}", config.signal.service_url);
        return Err(anyhow::anyhow!("Signal API not reachable").into());
    }
    info!("Signal API healthy");

    // Engine and background tasks
    let engine = OtpEngine::open(config.engine.clone(), provider, notifier.clone())
        .await
        .context("Failed to open engine store")?;

    let poller = engine.spawn_poller();
    let server = otp_core::spawn_webhook_server(engine.clone(), &config.engine.server)
        .await
        .context("Failed to start webhook server")?;

    let handlers = build_handlers(engine.clone(), notifier);
    info!("Registered {} command handlers", handlers.len());
    let mut dispatcher = ChatDispatcher::new(handlers, signal.clone());
    info!(
        "Admins: {}, poll interval: {:?}",
        config.engine.admin_ids.len(),
        config.engine.poll_interval
    );
    info!("Listening for messages...");

    // Start message receiver
    let receiver = MessageReceiver::new(signal.clone(), config.signal.poll_interval);
    let mut stream = Box::pin(receiver.stream());

    // Main message loop
    loop {
        tokio::select! {
            Some(message) = stream.next() => dispatcher.submit(message),
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down...");
    poller.abort();
    server.abort();
    if let Err(e) = engine.store().persist().await {
        error!("Final store persist failed: {}", e);
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
