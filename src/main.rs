mod bridge;
mod config;
mod connection;
mod mqtt;
mod node_cache;
mod packet;
mod queue;
mod radio;
mod shutdown;
mod status;
mod traceroute;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge::{Bridge, BridgeSettings};
use config::{Config, ConnectionType};
use connection::{ConnectionManager, ConnectionManagerSettings};
use mqtt::{MqttClient, MqttSettings};
use node_cache::NodeCache;
use radio::RadioConfig;
use shutdown::Shutdown;
use traceroute::{TracerouteManager, TracerouteManagerSettings, TraceroutePersistence};

const FORCE_EXIT_WATCHDOG: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    color_eyre::install()?;

    let config = match Config::resolve() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let exit_code = run(config).await;
    std::process::exit(exit_code);
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: Config) -> i32 {
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let radio_config = match config.connection_type {
        ConnectionType::Tcp => RadioConfig::Tcp {
            host: config.node_ip.clone().expect("validated by Config::resolve"),
            port: RadioConfig::DEFAULT_TCP_PORT,
        },
        ConnectionType::Serial => RadioConfig::Serial {
            path: config.serial_port.clone().expect("validated by Config::resolve"),
        },
    };

    let connection = ConnectionManager::spawn(
        radio_config,
        ConnectionManagerSettings::default(),
        shutdown.clone(),
    );

    if !connection.connect().await && !connection.reconnect().await {
        error!("could not establish an initial radio session, exiting");
        connection.close().await;
        return 1;
    }

    let traceroute_settings = TracerouteManagerSettings {
        interval: Duration::from_secs(config.traceroute_interval),
        cooldown: Duration::from_secs(config.traceroute_cooldown),
        max_retries: config.traceroute_max_retries,
        max_backoff: Duration::from_secs(config.traceroute_max_backoff),
        ..TracerouteManagerSettings::default()
    };
    let persistence = TraceroutePersistence::new(config.traceroute_persistence_file.clone());
    let traceroute =
        TracerouteManager::spawn(connection.clone(), persistence, traceroute_settings, shutdown.clone())
            .await;

    let node_cache = Arc::new(NodeCache::new());

    let mqtt_settings = MqttSettings {
        broker: config.broker.clone(),
        port: config.port,
        client_id: "meshtastic-mqtt-bridge".to_string(),
        username: config.username.clone(),
        password: config.password.clone(),
        tls: config.tls,
        listen_topic: config.mqtt_listen_topic.clone(),
        keep_alive: Duration::from_secs(30),
    };
    let mqtt_client = MqttClient::spawn(mqtt_settings, shutdown.clone());

    let bridge_settings = BridgeSettings {
        root_topic: config.topic.clone(),
        ..BridgeSettings::default()
    };
    let bridge = Bridge::spawn(
        connection.clone(),
        node_cache.clone(),
        traceroute.clone(),
        mqtt_client.clone(),
        bridge_settings,
        shutdown.clone(),
    );

    let status_handle = config.status_addr.as_deref().and_then(|addr| {
        match addr.parse::<SocketAddr>() {
            Ok(addr) => Some(status::spawn(
                addr,
                connection.clone(),
                node_cache.clone(),
                traceroute.clone(),
                shutdown.clone(),
            )),
            Err(e) => {
                warn!(error = %e, addr, "invalid --status-addr, status endpoint disabled");
                None
            }
        }
    });

    shutdown.cancelled().await;
    info!("shutdown signal received, cleaning up");

    let cleanup = async {
        traceroute.cleanup().await;
        bridge.close().await;
        connection.close().await;
        mqtt_client.disconnect().await;
        if let Some(handle) = status_handle {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    };

    if tokio::time::timeout(FORCE_EXIT_WATCHDOG, cleanup).await.is_err() {
        warn!("cleanup did not finish within the watchdog window, forcing exit");
    }

    0
}

fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        shutdown.cancel();
    });
}
