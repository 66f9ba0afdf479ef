//! veild — veil device daemon.
//!
//! Creates the configured devices, binds their transport sockets and serves
//! the control protocol until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use veil_control::configure;
use veil_control::request::{DeviceChange, Target};
use veil_control::{Caller, Control, NetNamespace, Namespaces, INIT_USER_NS};
use veil_core::config::{DeviceConfig, VeilConfig};
use veil_core::crypto::parse_hex_key;

mod server;
mod transport;

use server::ControlServer;
use transport::UdpDataPlane;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = VeilConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VeilConfig::load().context("failed to load config")?;
    tracing::info!(
        socket = %config.control.socket_path.display(),
        devices = config.devices.len(),
        "veild starting"
    );

    let namespaces = Arc::new(Namespaces::new());
    let init = namespaces.init();
    let data_plane = Arc::new(UdpDataPlane::new(init.handle()));
    let admin = Caller::new(std::process::id(), init.clone()).with_capability(INIT_USER_NS);

    for device in &config.devices {
        setup_device(&namespaces, &init, &admin, data_plane.clone(), device)
            .with_context(|| format!("failed to set up device {}", device.name))?;
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let control = Arc::new(Control::new(namespaces.clone(), config.control.max_message_size));
    let server = ControlServer::bind(&config.control.socket_path, control, shutdown_tx.subscribe())?;
    let server_task = tokio::spawn(server.run());

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = server_task => tracing::error!("control server exited: {:?}", r),
    }

    data_plane.close_all();
    Ok(())
}

/// Create one configured device and apply its settings through the same
/// mutation path control clients use.
fn setup_device(
    namespaces: &Namespaces,
    netns: &NetNamespace,
    admin: &Caller,
    data_plane: Arc<UdpDataPlane>,
    config: &DeviceConfig,
) -> Result<()> {
    let device = netns.create_device(&config.name, data_plane)?;

    let private_key = match &config.private_key_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Some(parse_hex_key(&text).with_context(|| format!("bad key in {}", path.display()))?)
        }
        None => None,
    };
    let change = DeviceChange {
        target: Target::default(),
        flags: 0,
        listen_port: Some(config.listen_port),
        fwmark: Some(config.fwmark),
        private_key,
        transit_netns: None,
        peers: Vec::new(),
    };
    configure::apply(namespaces, admin, &device, &change)?;

    if config.up {
        device.open()?;
    }
    tracing::info!(
        device = %device.name(),
        ifindex = device.ifindex(),
        public_key = %device.public_key().map(hex::encode).unwrap_or_default(),
        up = device.is_up(),
        "device ready"
    );
    Ok(())
}
