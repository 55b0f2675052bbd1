use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_accel::engine::{self, SimEngine, SimEngineConfig, spawn_dispatcher};
use mvirt_accel::{AccelConfig, AccelController, CounterSnapshot, GlobalCounters, MemoryFlowDb};

mod simulation;

use simulation::Simulation;

/// Capacity of the engine event channel.
const EVENT_CAPACITY: usize = 4096;

/// How long shutdown waits for outstanding destroys.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "mvirt-accel")]
#[command(about = "Flow acceleration controller, driven by a simulated engine")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of synthetic flows
    #[arg(short, long, default_value_t = 64)]
    flows: u16,

    /// Consecutive negative acknowledgements before a flow gives up
    #[arg(long)]
    nack_limit: Option<u32>,

    /// Make the engine reject one create in every N
    #[arg(long)]
    engine_nack_every: Option<u32>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    duration: Option<u64>,
}

#[derive(Serialize)]
struct Report {
    timestamp: DateTime<Utc>,
    flows: usize,
    inflight: usize,
    #[serde(flatten)]
    counters: CounterSnapshot,
}

fn report(controller: &AccelController) -> anyhow::Result<()> {
    let report = Report {
        timestamp: Utc::now(),
        flows: controller.db().len(),
        inflight: controller.inflight_len(),
        counters: controller.counters(),
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mvirt_accel=info".into()))
        .with(fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AccelConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AccelConfig::default(),
    };
    if let Some(nack) = args.nack_limit {
        config.limits.nack = nack;
    }
    config.validate().context("invalid configuration")?;

    info!(
        flows = args.flows,
        nack_limit = config.limits.nack,
        engine_nack_every = ?args.engine_nack_every,
        "Starting mvirt-accel simulation"
    );

    let (events_tx, events_rx) = engine::event_channel(EVENT_CAPACITY);
    let sim_engine = Arc::new(SimEngine::new(
        events_tx,
        SimEngineConfig {
            nack_every: args.engine_nack_every,
            ..SimEngineConfig::default()
        },
    ));
    let controller = Arc::new(AccelController::new(
        Arc::new(MemoryFlowDb::new()),
        sim_engine.clone(),
        Arc::new(simulation::build_topology()),
        Arc::new(GlobalCounters::new()),
        config.clone(),
    ));

    let dispatcher = spawn_dispatcher(controller.clone(), events_rx)
        .context("failed to start engine event dispatcher")?;
    let mut sim = Simulation::start(controller.clone(), sim_engine, args.flows)
        .context("failed to start simulation")?;

    let mut interval = tokio::time::interval(Duration::from_secs(config.stats_interval_secs));
    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl-C, shutting down...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed, shutting down...");
                break;
            }
            _ = interval.tick() => {
                controller.reap_idle(Instant::now());
                report(&controller)?;
            }
        }
    }

    sim.stop_traffic();
    controller.set_terminate_pending();

    // Creates still in flight become accelerated later and need another pass
    let started = Instant::now();
    loop {
        controller.decelerate_all();
        let counters = controller.counters();
        if counters.accelerated == 0 && counters.pending_decel == 0 && controller.inflight_len() == 0
        {
            break;
        }
        if started.elapsed() > DRAIN_TIMEOUT {
            warn!(
                accelerated = counters.accelerated,
                pending_decel = counters.pending_decel,
                inflight = controller.inflight_len(),
                "Gave up waiting for engine responses"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    sim.stop();
    dispatcher.stop();
    drop(dispatcher);

    report(&controller)?;
    info!("Simulation stopped");
    Ok(())
}
