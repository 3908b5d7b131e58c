mod camera;
mod config;
mod pump;
mod scheduler;
mod sensor;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camera::CaptureManager;
use pump::Pump;
use scheduler::Supervisor;
use sensor::SensorReader;
use state::{ControllerState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config (read once; invalid or missing config is fatal) ──────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let settings = config::load(&config_path)?;
    info!(path = %config_path, "config loaded");

    // ── Hardware ────────────────────────────────────────────────────
    let sensors = SensorReader::new(settings.sensor.clone());
    let pump = Pump::new(&settings.watering)?;
    let camera = CaptureManager::new(&settings.storage, settings.camera.clone())?;

    // ── Shared state (capture history restored from disk) ───────────
    let state: SharedState = Arc::new(RwLock::new(ControllerState::new()));
    {
        let mut st = state.write().await;
        st.record_system("controller started".to_string());
        if let Some(last) = camera.latest_capture() {
            info!(file = %last.file_name, "restored capture history");
            st.last_capture = Some(last);
        }
    }

    // ── Supervisor tasks ────────────────────────────────────────────
    let supervisor = Supervisor::new(settings, Arc::clone(&state), sensors, pump, camera)?;
    supervisor.spawn_tasks();

    // ── Web server ──────────────────────────────────────────────────
    let api = web::ApiState {
        state,
        supervisor: Arc::clone(&supervisor),
    };
    tokio::spawn(async move { web::serve(api).await });

    // ── Graceful shutdown ───────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for in-flight hardware operations");
    supervisor.shutdown().await;
    Ok(())
}
