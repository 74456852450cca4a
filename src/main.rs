use std::{process, sync::OnceLock};

use tracing::{debug, error, info, warn};
use warren::{
    config::Config,
    core::{handler::LogHandler, signal::wait_for_shutdown_signal},
    logger::LoggerManager,
    print_error,
};
use warren_amqp::{Client, ClientError, Topology};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_topology(topology: &Topology) {
    info!("Queue        | {}", topology.queue());
    match topology.dead_letter_queue() {
        Some(dead_letter) => info!("Dead letters | {}", dead_letter),
        None => info!("Dead letters | (none, this is a dead-letter queue)"),
    }
    info!("Exchange     | {}", topology.exchange());
    for key in topology.routing_keys() {
        info!("Binding      | {}", key);
    }
}

#[cfg(feature = "amqp")]
fn open(cfg: &Config) -> Result<Client, ClientError> {
    Client::open(cfg.broker.clone(), warren_amqp::transport::lapin::LapinTransport::new())
}

#[cfg(not(any(feature = "amqp", feature = "memory")))]
compile_error!("warren needs a transport: enable the `amqp` or `memory` feature");

#[cfg(all(not(feature = "amqp"), feature = "memory"))]
fn open(cfg: &Config) -> Result<Client, ClientError> {
    warn!("Built without the amqp feature: using the in-process broker");
    Client::open(cfg.broker.clone(), warren_amqp::transport::memory::MemoryBroker::new())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting warren version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.broker);

    let client = open(cfg).unwrap_or_else(|e| {
        error!("Failed to open broker client: {}", e);
        process::exit(1);
    });
    log_topology(client.topology());

    let consumer = {
        let client = client.clone();
        tokio::spawn(async move { client.consume_with(LogHandler::default()).await })
    };

    let mut state = client.subscribe_state();
    let state_logger = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            if current.is_ready() {
                info!("warren online");
            }
            debug!("Broker client state: {}", current);
            if current.is_closed() {
                break;
            }
        }
    });

    match wait_for_shutdown_signal().await {
        Ok(signal) => info!("Received {}, initiating graceful shutdown...", signal),
        Err(e) => error!("Failed to listen for shutdown signals: {}. Shutting down", e),
    }

    match client.close().await {
        Ok(()) => {}
        Err(ClientError::AlreadyClosed) => debug!("Broker client was not connected at shutdown"),
        Err(e) => warn!("Failed to close broker client cleanly: {}", e),
    }
    if let Err(e) = consumer.await {
        error!("Consumer task failed: {}", e);
    }
    client.wait_closed().await;
    let _ = state_logger.await;

    info!("Shutdown complete");
    Ok(())
}
