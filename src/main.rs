mod audio;
mod config;
mod control_bridge;
mod controller;
mod error;
mod net_link;
mod protocol;
mod session;

use audio::AlsaBackend;
use config::Config;
use control_bridge::{ControlBridge, ControlEvent};
use controller::{CoreController, DialOutcome};
use net_link::{LinkEvent, NetLinkOptions};
use session::{PermissionGate, SessionDeps, SessionSlot};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.apply_env_overrides();
    log::info!(
        "{} {} starting, media endpoint {}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.ws_url
    );

    // UI commands in, link events from the active session in
    let (tx_control, mut rx_control) = mpsc::channel::<ControlEvent>(32);
    let (tx_link, mut rx_link) = mpsc::channel::<LinkEvent>(100);
    let (tx_dial, mut rx_dial) = mpsc::channel::<DialOutcome>(4);

    let control = Arc::new(ControlBridge::new(&config, tx_control).await?);
    let control_clone = control.clone();
    tokio::spawn(async move {
        if let Err(e) = control_clone.run().await {
            log::error!("ControlBridge error: {:#}", e);
        }
    });

    let deps = SessionDeps {
        backend: Arc::new(AlsaBackend::from_config(&config)),
        permission: Arc::new(PermissionGate::new(config.auto_grant_microphone)),
        slot: SessionSlot::new(),
        options: NetLinkOptions::from_config(&config),
        playback_queue: config.playback_queue,
        events: tx_link,
    };
    let mut controller = CoreController::new(config.ws_url.clone(), deps, control, tx_dial);
    controller.announce().await;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            Some(event) = rx_control.recv() => controller.handle_control_event(event).await,
            Some(event) = rx_link.recv() => controller.handle_link_event(event).await,
            Some(outcome) = rx_dial.recv() => controller.handle_dial_outcome(outcome).await,
        }
    }

    controller.shutdown().await;
    Ok(())
}
