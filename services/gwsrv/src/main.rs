//! Modbus TCP gateway service

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gwsrv::bootstrap::{self, Args};
use gwsrv::persistence::FileRestartCounter;
use gwsrv::serial::RtuFieldBus;
use gwsrv::telemetry::ModbusTcpPeer;
use gwsrv::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Dump before logging so the output stays clean YAML
    if args.dump_config {
        let config = bootstrap::load_config(&args.config_source())
            .context("Failed to load configuration")?;
        print!("{}", bootstrap::dump_config(&config)?);
        return Ok(());
    }

    let _log_guard = bootstrap::initialize_logging(&args).context("Failed to init logging")?;
    let config =
        bootstrap::load_config(&args.config_source()).context("Failed to load configuration")?;

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let store = Arc::new(FileRestartCounter::new(
        &config.metrics.restart_counter_path,
    ));
    let bus = RtuFieldBus::new(config.serial.clone());
    let peer = config
        .peer
        .enabled
        .then(|| ModbusTcpPeer::new(config.peer.address, config.peer.unit_id));
    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;

    let gateway = Gateway::build(config, bus, peer, store).context("Failed to build gateway")?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            },
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    gateway.run(listener, token).await?;
    Ok(())
}
