mod command;
mod config;
mod connection;
mod device;
mod monitor;

use anyhow::Result;
use command::{CharacteristicDispatcher, LightsController};
use config::{DeviceMode, LinkConfig};
use connection::ConnectionSession;
use device::{DeviceHandle, SimulatedConfig, SimulatedPeripheral};
use monitor::ConnectionStateMonitor;
use std::sync::Arc;
use std::time::Duration;
use trailer_shared::Light;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Pause between light changes
const LIGHT_STEP: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = LinkConfig::from_env()?;

    info!("Trailer lights starting: {}", config.address);
    info!("  Device mode: {:?}", config.mode);

    match config.mode {
        DeviceMode::Simulated => {
            let device = Arc::new(SimulatedPeripheral::new(
                config.address,
                SimulatedConfig::default(),
            ));
            // Exercise silent reconnects during development
            let _drops = device.spawn_link_drops(Duration::from_secs(8));
            run(device, config).await
        }
        DeviceMode::Bluez => run_bluez(config).await,
    }
}

#[cfg(feature = "bluez")]
async fn run_bluez(config: LinkConfig) -> Result<()> {
    let device = device::BluezPeripheral::open(config.address).await?;
    info!("  Adapter: {}", device.adapter_name());
    run(Arc::new(device), config).await
}

#[cfg(not(feature = "bluez"))]
async fn run_bluez(_config: LinkConfig) -> Result<()> {
    anyhow::bail!("BlueZ mode requires building with the `bluez` feature")
}

async fn run<D: DeviceHandle>(device: Arc<D>, config: LinkConfig) -> Result<()> {
    // State display is independent of the session
    let monitor = ConnectionStateMonitor::new(device.clone());
    let mut states = monitor.start();

    let session = ConnectionSession::new(device, config.session());
    let dispatcher = CharacteristicDispatcher::new(session.current_connection())
        .with_timeout(config.operation_timeout);
    let lights = LightsController::new(dispatcher);

    session.connect();

    let light_show = tokio::spawn(async move {
        for light in [Light::Tail, Light::Left, Light::Right] {
            lights.turn_on(light).await?;
            tokio::time::sleep(LIGHT_STEP).await;
        }
        lights.turn_off().await?;

        let mode = lights.read_mode().await?;
        info!("Trailer mode read back: {}", mode);
        anyhow::Ok(())
    });
    tokio::pin!(light_show);
    let mut show_running = true;

    loop {
        tokio::select! {
            Some(state) = states.recv() => {
                info!("Connection state: {}", state);
            }
            result = &mut light_show, if show_running => {
                show_running = false;
                match result {
                    Ok(Ok(())) => info!("Light cycle complete, Ctrl-C to disconnect"),
                    Ok(Err(e)) => error!("Light cycle failed: {:#}", e),
                    Err(e) => error!("Light cycle task panicked: {}", e),
                }
            }
            _ = session.closed(), if !show_running => {
                warn!("Session closed unexpectedly");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    session.disconnect();
    session.closed().await;
    info!("Disconnected from {}", session.address());
    Ok(())
}
