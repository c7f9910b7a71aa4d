use anyhow::Result;
use screendeck_player::agent::Agent;
use screendeck_player::config::{DisplayBackend, Settings};
use screendeck_player::display::{self, DisplayPort};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,screendeck_player=debug")),
        )
        .init();

    let settings = Settings::load()?;
    info!(
        "Starting screendeck-player (server {}, data in {:?})",
        settings.server.base_url, settings.data_dir
    );

    let (handle, port) = display::link();
    start_display(&settings, port)?;

    let agent = Agent::new(settings)?;
    tokio::select! {
        result = agent.run(handle) => result?,
        _ = shutdown_signal() => info!("Shutting down"),
    }

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn start_display(settings: &Settings, port: DisplayPort) -> Result<()> {
    match settings.display.backend {
        DisplayBackend::Headless => {
            display::spawn_headless(
                port,
                Duration::from_secs(settings.display.headless_video_secs),
            );
        }
        #[cfg(feature = "sdl")]
        DisplayBackend::Sdl => {
            display::spawn_sdl(port, settings.display.clone())?;
        }
        #[cfg(not(feature = "sdl"))]
        DisplayBackend::Sdl => {
            anyhow::bail!(
                "this build has no SDL display; rebuild with `--features sdl` or set display.backend = \"headless\""
            );
        }
    }
    Ok(())
}
