mod actuators;
mod board;
mod config;
mod control;
mod debounce;
mod dispatch;
mod error;
mod interlock;
mod mqtt;
mod sensors;
mod state;
mod telemetry;
mod web;

use anyhow::{anyhow, Context, Result};
use std::{env, sync::Arc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use actuators::{Actuators, SharedActuators};
use board::Board;
use control::ControlLoop;
use dispatch::{DispatchTask, Dispatcher};
use error::ControllerError;
use mqtt::{Pump, Topics};
use sensors::SensorGateway;
use state::SystemState;
use telemetry::Publish;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "home_controller=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "controller.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        backend = ?cfg.board.backend,
        broker = %format_args!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        "configuration loaded"
    );

    // ── Board + actuators ───────────────────────────────────────────
    let board = board::open(&cfg.board).context("failed to open board")?;
    let mut bundle = Actuators::new(Arc::clone(&board));
    bundle.initialise();
    let actuators = bundle.shared();

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // The dispatcher must never see a fabricated snapshot, so the first
    // one is taken before any task starts.
    let mut gateway = SensorGateway::new(Arc::clone(&board));
    let (snap_tx, snap_rx) = watch::channel(Arc::new(gateway.sample(Instant::now())));

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Arc::new(Topics::new(&cfg.mqtt.topic_prefix));
    let (client, eventloop) = mqtt::connect(&cfg.mqtt);
    let publisher: Arc<dyn Publish> = Arc::new(client.clone());

    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("failed to listen for ctrl-c: {e}"),
            }
        });
    }

    // ── Web server ──────────────────────────────────────────────────
    if cfg.web.enabled {
        let web_state = Arc::clone(&shared);
        let port = cfg.web.port;
        let web_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_state, port, web_shutdown).await {
                error!("{e:#}");
            }
        });
    }

    // ── Tasks ───────────────────────────────────────────────────────
    let (cmd_tx, cmd_rx) = mpsc::channel(cfg.control.command_queue);

    let pump = tokio::spawn(
        Pump {
            eventloop,
            client: client.clone(),
            topics: Arc::clone(&topics),
            commands: cmd_tx,
            shared: Arc::clone(&shared),
        }
        .run(shutdown.clone()),
    );

    let dispatcher = tokio::spawn(
        DispatchTask {
            dispatcher: Dispatcher::new(cfg.thresholds, cfg.control.gate_hold()),
            topics: Arc::clone(&topics),
            commands: cmd_rx,
            snapshots: snap_rx,
            actuators: Arc::clone(&actuators),
            publisher: Arc::clone(&publisher),
            shared: Arc::clone(&shared),
        }
        .run(shutdown.clone()),
    );

    let control = ControlLoop::new(
        Arc::clone(&board),
        gateway,
        Arc::clone(&actuators),
        snap_tx,
        publisher,
        topics,
        Arc::clone(&shared),
        cfg.thresholds,
        cfg.control.tick_period(),
    );
    let loop_result = control.run(shutdown.clone()).await;

    // ── Teardown ────────────────────────────────────────────────────
    shutdown.cancel();
    let pump_result = teardown(pump, dispatcher, &actuators, board.as_ref()).await;
    if let Err(e) = client.try_disconnect() {
        warn!("mqtt disconnect not sent: {e}");
    }

    loop_result.context("control loop failed")?;
    pump_result?;
    info!("controller stopped");
    Ok(())
}

/// Join the background tasks, then drive the actuators to the safe stance
/// and release the board. Runs on every exit path, including a panicked
/// task; the pump's outcome is returned only afterwards.
async fn teardown(
    pump: JoinHandle<Result<(), ControllerError>>,
    dispatcher: JoinHandle<()>,
    actuators: &SharedActuators,
    board: &dyn Board,
) -> Result<()> {
    let pump_result = match pump.await {
        Ok(result) => result.context("mqtt connection failed"),
        Err(e) => {
            error!("mqtt task ended abnormally: {e}");
            Err(anyhow!("mqtt task ended abnormally: {e}"))
        }
    };
    if let Err(e) = dispatcher.await {
        warn!("dispatcher task ended abnormally: {e}");
    }

    actuators.lock().await.safe_stance();
    board.release();
    pump_result
}

// ===========================================================================
// Tests
// ===========================================================================
