pub mod catalog;
pub mod config;
pub mod device;
pub mod flow;
pub mod serial;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use catalog::CommandInterpreter;
use config::AppSettings;
use device::DeviceManager;
use serial::engine::EngineEvent;
use serial::NativePortOpener;

/// Headless console session: load the catalog, connect, stream telemetry and
/// log everything until Ctrl-C.
pub async fn run(settings: AppSettings) -> anyhow::Result<()> {
    let mut interpreter = CommandInterpreter::new();
    if let Err(e) = interpreter.load_from_file(&settings.catalog_path) {
        log::warn!("Continuing without command catalog: {}", e);
    }
    let interpreter = Arc::new(interpreter);
    log::info!("{} catalog command(s) available", interpreter.commands().len());

    let (manager, mut events) = DeviceManager::new(Arc::new(NativePortOpener::new()), &settings);
    let candidates = manager.discover_devices().await;
    for device in &candidates {
        log::info!(
            "Found {} ({} {})",
            device.port_name,
            device.manufacturer.as_deref().unwrap_or("unknown"),
            device.product.as_deref().unwrap_or("device")
        );
    }

    if settings.auto_connect {
        let target = match &settings.port {
            Some(port) => Some(manager.add_port(port).await),
            None => candidates.first().cloned(),
        };
        match target {
            Some(device) => {
                let device = manager
                    .connect_device(&device.id)
                    .await
                    .with_context(|| format!("Failed to connect to {}", device.port_name))?;
                log::info!(
                    "Connected to {} (firmware {})",
                    device.port_name,
                    device.firmware_version.as_deref().unwrap_or("unknown")
                );
                manager
                    .protocol()
                    .start_telemetry(settings.telemetry.keys.clone(), settings.telemetry.rate_hz)
                    .await
                    .context("Failed to start telemetry")?;
            }
            None => log::warn!("No candidate device found; nothing to connect to"),
        }
    }

    monitor(&manager, &mut events).await;

    if let Err(e) = manager.protocol().stop_telemetry().await {
        log::debug!("Stopping telemetry failed: {}", e);
    }
    if manager.get_connected_device_id().await.is_some() {
        manager.disconnect_device().await.context("Failed to disconnect")?;
    }
    manager.protocol().shutdown().await;
    log::info!("Session finished");
    Ok(())
}

async fn monitor(manager: &DeviceManager, events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                manager.apply_event(&event).await;
                log_event(&event);
            }
        }
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Telemetry(sample) => log::info!(
            "vbus={:.2}V ibus={:.2}A vel={:.3} pos={:.3} state={:?}",
            sample.bus_voltage,
            sample.bus_current,
            sample.velocity,
            sample.position,
            sample.axis_state
        ),
        EngineEvent::TransportError(message) => log::warn!("Transport error: {}", message),
        EngineEvent::ReconnectExhausted { attempts } => {
            log::error!("Gave up reconnecting after {} attempts", attempts)
        }
        other => log::info!("{:?}", other),
    }
}
