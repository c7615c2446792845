use std::{
    process,
    sync::{Arc, OnceLock},
};

use parkgate::{
    config::Config,
    core::{
        gateway::Gateway,
        sensors::{sim::SimSensor, SensorSource},
        subscriber::Subscriber,
    },
    logger::LoggerManager,
    print_error,
};
use parkgate_mqtt::BrokerClient;
use tracing::{debug, error, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Builds the simulated sensor fleet from the `[sensors]` config table.
fn build_sensors(cfg: &Config) -> Vec<Arc<dyn SensorSource>> {
    cfg.sensors
        .enabled
        .iter()
        .filter_map(|spec| match SimSensor::from_spec(spec) {
            Some(sensor) => Some(Arc::new(sensor) as Arc<dyn SensorSource>),
            None => {
                error!(
                    "unknown sensor protocol '{}' for '{}', skipping",
                    spec.protocol, spec.location
                );
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to set up log manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init log manager: {}", e);
        process::exit(1);
    });

    info!("Starting parkgate version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.broker);

    let client = Arc::new(BrokerClient::new(
        cfg.broker.clone().with_client_id(cfg.gateway.id.clone()),
    ));
    let gateway = Gateway::new(cfg.gateway.clone(), cfg.topics.clone(), client);

    let sensors = build_sensors(cfg);
    if sensors.is_empty() {
        error!("No usable sensors configured, exiting");
        process::exit(1);
    }
    gateway.register_sensors(sensors);

    if let Err(e) = gateway.start().await {
        error!("Failed to start gateway: {e}");
        process::exit(1);
    }

    let subscriber = if cfg.subscriber.enabled {
        let subscriber = Subscriber::new(
            cfg.subscriber.clone(),
            cfg.topics.clone(),
            cfg.broker.clone(),
        );
        if let Err(e) = subscriber.start().await {
            error!("Failed to start subscriber: {e}");
            gateway.stop().await;
            process::exit(1);
        }
        Some(subscriber)
    } else {
        None
    };

    info!(
        "Gateway running against {}:{} — press Ctrl+C to stop",
        cfg.broker.host, cfg.broker.port
    );
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C — initiating graceful shutdown...");

    if let Some(subscriber) = &subscriber {
        subscriber.stop().await;
    }
    gateway.stop().await;

    let stats = gateway.get_stats();
    info!(
        "Final stats: collected={}, published={}, alerts={}, errors={}",
        stats.readings_collected, stats.readings_published, stats.alerts_sent, stats.errors
    );
    info!("Shutdown complete");
    Ok(())
}
