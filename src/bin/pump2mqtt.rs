//! pump2mqtt daemon
//!
//! Loads settings and the entity definition table, connects to the heat
//! pump and the MQTT broker, announces Home Assistant discovery and runs
//! the publish loop until interrupted.
//!
//! Usage: pump2mqtt [-c config.toml] [-v...]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pump2mqtt::{
    Bridge, BridgeResult, DefinitionTable, EntityRegistry, ModbusTcpTransport, MqttPublisher,
    Settings,
};

#[derive(Parser, Debug)]
#[command(name = "pump2mqtt", version, about = "Publish heat pump data to MQTT")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("pump2mqtt={default_level}"))),
        )
        .init();

    if let Err(err) = run(args).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> BridgeResult<()> {
    let settings = Settings::load(args.config.as_deref())?;

    let entities = DefinitionTable::load(&settings.device.definitions)?.into_entities()?;
    let registry = Arc::new(EntityRegistry::from_entities(entities)?);
    info!(
        "Loaded {} entities from {} ({} read blocks)",
        registry.len(),
        settings.device.definitions.display(),
        registry.ranges().len()
    );

    // Host presence is validated by Settings::load.
    let host = settings.modbus.host.as_deref().unwrap_or_default();
    let transport = ModbusTcpTransport::connect(
        host,
        settings.modbus.port,
        settings.modbus.slave_id,
        settings.modbus.timeout(),
    )
    .await?;
    info!(
        "Connected to Modbus TCP server at {host}:{}",
        settings.modbus.port
    );

    let (publisher, commands) = MqttPublisher::connect(&settings.mqtt).await?;
    publisher.announce(&registry, &settings.device).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut bridge = Bridge::new(
        registry,
        transport,
        publisher,
        commands,
        settings.polling_interval(),
    );
    bridge.run(shutdown_rx).await
}
