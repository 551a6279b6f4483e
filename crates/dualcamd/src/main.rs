use anyhow::{Context, Result};
use dualcam_hw::V4lFactory;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod hotplug;

use config::{BusKind, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("dualcamd starting");

    let config = Config::from_env();
    let bus = config.bus;
    let poll_interval = config.poll_interval;
    tracing::info!(
        variant = config.variant.name(),
        fps = config.fps,
        rotation = config.rotation.degrees(),
        ?bus,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(
        config,
        Arc::new(V4lFactory),
        Arc::new(hotplug::node_access),
        tokio::runtime::Handle::current(),
    )
    .context("failed to start engine")?;

    let service = dbus_interface::DualCamService {
        engine: engine.clone(),
    };
    let builder = match bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name("org.freedesktop.DualCam1")?
        .serve_at("/org/freedesktop/DualCam1", service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    let poller = hotplug::spawn_poller(engine.clone(), poll_interval);

    tracing::info!("dualcamd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("dualcamd shutting down");
    poller.abort();
    engine.shutdown().await;

    Ok(())
}
