use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::agents;
use crate::config::Config;
use crate::server::{self, AppState};
use crate::store::{Histogram, Store};

/// Runs the coordinator for the lifetime of the process: connects to every
/// configured agent, sets up the rolling store, starts the presentation
/// endpoint and the store flusher, installs shutdown handling, then drives
/// the capture control loop (§4.5) until a fatal RPC or store error occurs.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let timeout = Duration::from_millis(config.capture.timeout);
    let agent_list = agents::connect_all(&config.agents, timeout).await.context("connecting to agents")?;
    let agent_addresses: Vec<String> = agent_list.iter().map(|a| a.address.clone()).collect();
    let agent_count = agent_list.len();
    let agents = Arc::new(tokio::sync::Mutex::new(agent_list));

    let store = Arc::new(Store::open(&config.history.file, agent_count).context("setting up rolling store")?);
    let histogram = Arc::new(Histogram::new());

    spawn_presentation_endpoint(config.restport, Arc::clone(&store), Arc::clone(&histogram), agent_addresses)
        .await
        .context("starting presentation endpoint")?;
    spawn_store_flusher(Arc::clone(&store), config.history.period);
    spawn_shutdown_handler(Arc::clone(&agents));

    let period = Duration::from_millis(config.capture.period);
    let interval = Duration::from_millis(config.capture.interval);

    loop {
        let mut guard = agents.lock().await;
        if let Err(err) = run_round(&mut guard, &store, &histogram, period).await {
            tracing::error!(%err, "capture round failed, shutting down");
            agents::goodbye_all(&mut guard).await;
            return Err(err.into());
        }
        drop(guard);
        tokio::time::sleep(interval).await;
    }
}

async fn run_round(
    agents: &mut [agents::AgentInfo],
    store: &Store,
    histogram: &Histogram,
    period: Duration,
) -> Result<(), crate::error::CoordinatorError> {
    agents::start_capture_all(agents).await?;
    tokio::time::sleep(period).await;
    agents::get_results_all(agents).await?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    store.merge_and_store(agents, histogram, now_ms)?;
    Ok(())
}

async fn spawn_presentation_endpoint(
    restport: u16,
    store: Arc<Store>,
    histogram: Arc<Histogram>,
    agents: Vec<String>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{restport}").parse().context("parsing REST listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("binding REST listener")?;
    let state = Arc::new(AppState { store, histogram, agents });
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, server::router(state)).await {
            tracing::error!(%err, "presentation endpoint exited");
        }
    });
    Ok(())
}

fn spawn_store_flusher(store: Arc<Store>, period_minutes: u64) {
    let flush_every = Duration::from_secs(period_minutes * 60);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(flush_every).await;
            if let Err(err) = store.flush() {
                tracing::error!(%err, "failed to flush rolling store");
            }
        }
    });
}

fn spawn_shutdown_handler(agents: Arc<tokio::sync::Mutex<Vec<agents::AgentInfo>>>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, saying goodbye to agents");
        let mut guard = agents.lock().await;
        agents::goodbye_all(&mut guard).await;
        std::process::exit(0);
    });
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
