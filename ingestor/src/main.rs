use anyhow::Context;
use clap::Parser;
use ingestor::config::Cli;
use ingestor::dispatcher::{CommandDispatcher, MqttPublisher, Publisher};
use ingestor::health::PersistenceHealth;
use ingestor::ingest::IngestWorker;
use ingestor::parquet_store::ParquetStore;
use ingestor::registry::DeviceRegistry;
use ingestor::session::SessionState;
use ingestor::rest::{self, AppState};
use ingestor::store::DatasetStore;
use ingestor::{firmware, metrics, mqtt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    info!("Starting roadside ingestor");
    info!("MQTT broker: {}:{}", cli.mqtt_broker, cli.mqtt_port);
    info!("Dataset: {}", cli.dataset_path.display());
    info!("HTTP server: {}", cli.http_addr);

    metrics::init_metrics();

    let store = ParquetStore::open(&cli.dataset_path)
        .with_context(|| format!("opening dataset {}", cli.dataset_path.display()))?;
    let store: Arc<dyn DatasetStore> = Arc::new(store);
    info!("Dataset holds {} readings", store.len()?);

    let devices = match &cli.device_locations {
        Some(path) => DeviceRegistry::load(path)?,
        None => DeviceRegistry::dublin(),
    };
    info!("Device registry has {} known locations", devices.len());

    let health = Arc::new(PersistenceHealth::new(cli.persist_alarm_threshold));
    let cancel = CancellationToken::new();

    let mqtt_settings = cli.mqtt_settings()?;
    let command_qos = mqtt_settings.qos;
    let (client, eventloop) = mqtt::connect(&mqtt_settings)?;

    info!("Channel capacity: {}", cli.channel_capacity);
    let (tx, rx) = mpsc::channel(cli.channel_capacity);

    let worker = IngestWorker::new(store.clone(), health.clone(), cli.ingest_settings())?
        .with_acker(client.clone());
    let worker_handle = tokio::spawn(worker.run(rx, cancel.clone()));

    let (session_tx, session_rx) = watch::channel(SessionState::Disconnected);
    let mqtt_handle = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ran = mqtt::run_mqtt(client, eventloop, mqtt_settings, tx, session_tx, cancel.clone()).await;
            if let Err(e) = ran {
                error!("MQTT task failed: {}", e);
                cancel.cancel();
            }
        })
    };

    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(client, session_rx));
    let commands = CommandDispatcher::new(
        publisher,
        cli.command_topics(),
        command_qos,
        cli.command_timeout,
    );

    let app = rest::create_router(AppState {
        store,
        devices: Arc::new(devices),
        commands: Arc::new(commands),
        health,
    });

    let listener = tokio::net::TcpListener::bind(cli.http_addr)
        .await
        .with_context(|| format!("binding HTTP server to {}", cli.http_addr))?;
    info!("HTTP server listening on {}", cli.http_addr);

    let server_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = cancel.clone();
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("HTTP server error: {}", e);
                cancel.cancel();
            }
        })
    };

    let firmware_handle = match cli.firmware_settings() {
        Some(settings) => {
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = firmware::run(settings, cancel).await {
                    error!("Firmware server failed: {}", e);
                }
            }))
        }
        None => {
            warn!("No firmware certificate configured, firmware server disabled");
            None
        }
    };

    tokio::select! {
        _ = shutdown_signal() => info!("Received shutdown signal"),
        _ = cancel.cancelled() => error!("A core task stopped, shutting down"),
    }
    cancel.cancel();

    join("MQTT", mqtt_handle).await;
    join("ingestion worker", worker_handle).await;
    join("HTTP server", server_handle).await;
    if let Some(handle) = firmware_handle {
        join("firmware server", handle).await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!("{} task panicked: {}", name, e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
