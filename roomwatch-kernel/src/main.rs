/**
 * ROOMWATCH - Point d'entrée d'un noeud
 *
 * RÔLE : Bootstrap config, clé, contrôleur, bus MQTT, producteur et HTTP.
 * Le même binaire sert de noeud capteur (producer.enabled) et de noeud de
 * refroidissement (roles.cooling_control), ou des deux.
 *
 * ARRÊT : Ctrl-C bascule le signal watch, chaque tâche finit son travail en
 * cours, la session MQTT est fermée proprement.
 */

use anyhow::{Context, Result};
use roomwatch_kernel::broker::{BusHandle, ConnectionManager};
use roomwatch_kernel::config::{load_config, KernelConfig};
use roomwatch_kernel::controller::Controller;
use roomwatch_kernel::envelope::{EnvelopeCodec, SymmetricKey};
use roomwatch_kernel::events::EventBroadcaster;
use roomwatch_kernel::health::HealthTracker;
use roomwatch_kernel::http::{self, AppState};
use roomwatch_kernel::mqtt::MqttConnector;
use roomwatch_kernel::producer::{spawn_producer, SimulatedSource};
use roomwatch_kernel::router::TopicRouter;
use roomwatch_kernel::window::SystemClock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // local offset is only readable while the process is single-threaded
    let clock = SystemClock::detect();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?
        .block_on(run(clock))
}

async fn run(clock: SystemClock) -> Result<()> {
    let cfg: KernelConfig = load_config().await.context("loading configuration")?;
    info!(
        brokers = cfg.mqtt.brokers.len(),
        cooling_control = cfg.roles.cooling_control,
        producer = cfg.producer.enabled,
        "roomwatch node starting"
    );

    let codec = if cfg.encryption.enabled {
        let key = SymmetricKey::load_or_create(&cfg.encryption.key_path).context("provisioning encryption key")?;
        EnvelopeCodec::encrypted(&key)
    } else {
        warn!("payload encryption disabled, messages travel in clear");
        EnvelopeCodec::plaintext()
    };

    let events = EventBroadcaster::new(cfg.events.capacity);
    let health = HealthTracker::new();
    let bus = BusHandle::new();
    let controller = Controller::new(
        cfg.defaults.clone(),
        bus.clone(),
        events.clone(),
        Arc::new(codec),
        cfg.topics.clone(),
    )
    .with_clock(Arc::new(clock))
    .with_cooling_control(cfg.roles.cooling_control);
    let router = TopicRouter::new(controller.clone(), health.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // bus
    let manager = ConnectionManager::new(
        MqttConnector::from_config(&cfg.mqtt),
        cfg.mqtt.brokers.clone(),
        cfg.subscriptions(),
        bus,
        events,
        health.clone(),
    )
    .with_retry_delay(Duration::from_secs(cfg.mqtt.retry_delay_secs));
    let bus_task = tokio::spawn(manager.run(move |msg| router.route(&msg), shutdown_rx.clone()));

    // producteur simulé
    let producer_task = cfg.producer.enabled.then(|| {
        spawn_producer(
            controller.clone(),
            SimulatedSource::new(&cfg.producer),
            Duration::from_secs(cfg.producer.interval_secs),
            shutdown_rx.clone(),
        )
    });

    // HTTP
    let http_task = if cfg.http.enabled {
        let addr: SocketAddr = cfg.http.bind.parse().with_context(|| format!("http.bind {:?}", cfg.http.bind))?;
        let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
        info!("listening on http://{addr}");
        let app = http::build_router(AppState { controller: controller.clone(), health });
        let mut stop = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let graceful = async move {
                let _ = stop.wait_for(|down| *down).await;
            };
            axum::serve(listener, app).with_graceful_shutdown(graceful).await
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Some(task) = producer_task {
        task.await.context("producer task")?;
    }
    if let Some(task) = http_task {
        task.await.context("http task")?.context("http server")?;
    }
    bus_task.await.context("bus task")?;
    info!("roomwatch node stopped");
    Ok(())
}
