use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tracing::info;

use gudgeon::config::Config;
use gudgeon::engine::Engine;
use gudgeon::logger::{ConsoleLogSink, QueryLogger};
use gudgeon::server::DnsHandler;
use gudgeon::stats::StatsCollector;
use hickory_server::ServerFuture;

/// In-flight requests get this long to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // load config before logging init to get the level
    let config_path = std::env::args().nth(1).unwrap_or("gudgeon.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    gudgeon::init::setup_logging(&config);
    info!("Starting gudgeon...");

    if !std::path::Path::new(&config_path).exists() {
        info!("Config file not found, using defaults.");
    }

    std::fs::create_dir_all(&config.home)?;

    let stats = StatsCollector::new(config.stats.log_interval_seconds);
    let logger = QueryLogger::new(vec![Box::new(ConsoleLogSink::new(config.logging.clone()))]);

    let engine = Arc::new(Engine::from_config(&config)?);
    info!(
        "Engine ready: {} groups, rule store '{}'",
        engine.group_names().len(),
        config.storage.rules
    );

    let mut servers = Vec::new();
    for interface in &config.network.interfaces {
        let addr = SocketAddr::new(interface.ip, interface.port);
        let handler = DnsHandler::new(engine.clone(), stats.clone(), logger.clone(), interface.ip);
        let mut server = ServerFuture::new(handler);

        if config.network.udp {
            let udp_socket = UdpSocket::bind(addr).await?;
            server.register_socket(udp_socket);
        }
        if config.network.tcp {
            let tcp_listener = TcpListener::bind(addr).await?;
            server.register_listener(tcp_listener, Duration::from_secs(5));
        }

        info!("DNS server listening on {}", addr);
        servers.push(server);
    }

    signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    // stop accepting, give in-flight requests time, then drain the pools
    for mut server in servers {
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, server.shutdown_gracefully()).await;
    }
    engine.shutdown().await;

    Ok(())
}
