use anyhow::Result;
use std::fs;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::api::rest::{create_router, AppState};
use crate::controller::{ContainerRuntime, DockerManager, EnvironmentManager, SystemMetrics};
use crate::shared::LabConfig;

pub async fn run_rest_server(config: LabConfig) -> Result<()> {
    // Write PID file for process management
    let pid = process::id();
    let pid_file = "/tmp/ailab.pid";

    if let Err(e) = fs::write(pid_file, pid.to_string()) {
        warn!("Could not write PID file: {}", e);
    }

    let pid_file_cleanup = pid_file.to_string();
    ctrlc::set_handler(move || {
        info!("Shutting down AI Lab API...");
        let _ = fs::remove_file(&pid_file_cleanup);
        std::process::exit(0);
    })?;

    info!("Starting AI Lab environment manager (PID {})", pid);

    // Without Docker the API still serves catalog and availability routes.
    let runtime: Option<Arc<dyn ContainerRuntime>> = match DockerManager::connect().await {
        Ok(docker) => {
            info!("Connected to Docker");
            Some(Arc::new(docker))
        }
        Err(e) => {
            warn!("Docker not available: {}", e);
            None
        }
    };

    let manager = EnvironmentManager::from_config(&config, runtime, Arc::new(SystemMetrics::new()));
    let app_state = Arc::new(AppState::new(manager, config.clone()));

    if app_state.manager.runtime_available() {
        match app_state.manager.reconcile().await {
            Ok(report) => info!(
                "Startup reconciliation adopted {} environments",
                report.adopted.len()
            ),
            Err(e) => error!("Startup reconciliation failed: {}", e),
        }
        spawn_reconcile_loop(app_state.clone(), config.reconcile_interval_seconds);
    }

    let app = create_router(app_state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Binding to: {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("REST API Endpoint: http://{}/api", bind_addr);
    info!("Ready to accept requests...");

    let rest_server_result = axum::serve(listener, app).await;

    let _ = fs::remove_file(pid_file);

    rest_server_result?;
    Ok(())
}

fn spawn_reconcile_loop(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        return;
    }
    info!("Reconciling every {}s", interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        // The first tick fires immediately and startup already reconciled.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = state.manager.reconcile().await {
                error!("Periodic reconciliation failed: {}", e);
            }
        }
    });
}
