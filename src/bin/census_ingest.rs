//! CLI embedder. Exit codes: 0 success, 1 configuration failure,
//! 2 aborted by operator (SIGINT), 3 terminal failure of a required phase.

use std::env;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info};

use census_ingest::census_client::CensusClient;
use census_ingest::config::{Config, LoggingConfig};
use census_ingest::monitor::Monitor;
use census_ingest::orchestrator::{Orchestrator, RunState};
use census_ingest::queue::Queue;
use census_ingest::rate_limit::Accountant;
use census_ingest::store::StoreWriter;
use census_ingest::worker::WorkerPool;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    LoggingConfig::from_env().init();

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        return ExitCode::from(1);
    }
    let (store_max_connections, request_timeout, daily_limit, reserve_for_interactive) =
        (config.store_max_connections, config.request_timeout, config.daily_limit, config.reserve_for_interactive);
    let config = Arc::new(RwLock::new(config));

    let database_url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            error!("DATABASE_URL must be set");
            return ExitCode::from(1);
        }
    };

    let store = match StoreWriter::connect(&database_url, store_max_connections).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to connect to the analytic store");
            return ExitCode::from(1);
        }
    };

    let accountant = Arc::new(Accountant::new_in_memory(daily_limit, reserve_for_interactive, Duration::from_secs(60)));
    let queue = Arc::new(Queue::new());
    let monitor = Arc::new(Monitor::new());
    let client = Arc::new(CensusClient::new(request_timeout));
    let pool = Arc::new(WorkerPool::new(config.clone(), queue.clone(), accountant.clone(), store, monitor.clone(), client));
    let orchestrator = Arc::new(Orchestrator::new(config, queue, accountant, monitor, pool));

    let phases: Option<Vec<String>> = env::args().nth(1).map(|s| s.split(',').map(|p| p.to_string()).collect());
    orchestrator.start_loading(phases).await;

    let shutdown_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("operator abort requested");
        shutdown_orchestrator.stop().await;
    });

    let mut system = sysinfo::System::new_all();
    let tick_period = Duration::from_secs(2);

    loop {
        orchestrator.expand_ready_phases();
        orchestrator.pump_once().await;
        orchestrator.advance_if_phase_complete();

        system.refresh_memory();
        let memory_usage_ratio =
            if system.total_memory() == 0 { 0.0 } else { system.used_memory() as f64 / system.total_memory() as f64 };
        orchestrator.tick_health(memory_usage_ratio, tick_period);

        match orchestrator.state() {
            RunState::Idle => {
                info!("loading complete");
                return ExitCode::SUCCESS;
            }
            RunState::Stopped => {
                return ExitCode::from(2);
            }
            _ => {}
        }

        let health = orchestrator.health();
        if health.score < 40 {
            error!(score = health.score, "health degraded below recoverable threshold");
            return ExitCode::from(3);
        }

        tokio::time::sleep(tick_period).await;
    }
}
