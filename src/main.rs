use anyhow::Context;
use shunt_aggregator::config::{self, Config};
use shunt_aggregator::discovery::ScanTarget;
use shunt_aggregator::{
    AggregationEngine, BusClient, ControlSurface, EngineSettings, ModbusBus, ModbusBusSettings,
    RegisterExporter, VirtualDevicePublisher,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config::config_path().display(),
        mode = ?config.mode,
        "Starting shunt aggregator"
    );

    let modbus = config
        .modbus
        .clone()
        .context("A [modbus] section with the gateway and unit ids is required")?;

    let exporter = RegisterExporter::new();
    if let Some(listen) = &modbus.listen {
        let listen: SocketAddr = listen.parse().context("Invalid modbus.listen address")?;
        let server = exporter.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listen).await {
                error!(error = %e, "Register server stopped");
            }
        });
    }

    let gateway: SocketAddr = modbus
        .gateway
        .parse()
        .context("Invalid modbus.gateway address")?;
    let (bus, events) = ModbusBus::connect(
        ModbusBusSettings {
            gateway,
            unit_ids: modbus.unit_ids.clone(),
            poll_interval: Duration::from_millis(modbus.poll_interval_ms),
            lost_after_failures: modbus.lost_after_failures,
            address_prefix: config.member_prefix.clone(),
        },
        exporter,
    );
    let bus: Arc<dyn BusClient> = Arc::new(bus);

    let (control, control_rx) = ControlSurface::new(config.control_settings());
    let settings = control.current();
    info!(
        excluded = ?settings.excluded,
        display_names = ?settings.display_names,
        "Control settings"
    );
    let publisher = VirtualDevicePublisher::new(bus.clone(), config.identity());
    let settings = engine_settings(&config);
    let engine = AggregationEngine::new(bus, events, control_rx, publisher, settings);

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

fn engine_settings(config: &Config) -> EngineSettings {
    let (discovery_min, discovery_max) = config.discovery_bounds();
    EngineSettings {
        scan: ScanTarget {
            prefix: config.member_prefix.clone(),
            own_address: config.service_name.clone(),
            product_match: config.product_match.clone(),
        },
        discovery_min,
        discovery_max,
        search_trials: config.search_trials,
        log_period: config.log_period(),
        charge_limits: config.charge_limits(),
    }
}
