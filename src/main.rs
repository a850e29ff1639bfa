use std::env;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;

use census_ingest::census_client::CensusClient;
use census_ingest::config::{Config, LoggingConfig};
use census_ingest::handlers;
use census_ingest::monitor::Monitor;
use census_ingest::orchestrator::Orchestrator;
use census_ingest::queue::Queue;
use census_ingest::rate_limit::Accountant;
use census_ingest::store::StoreWriter;
use census_ingest::worker::WorkerPool;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let logging = LoggingConfig::from_env();
    logging.init();

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        eprintln!("configuration invalid: {e}");
        std::process::exit(1);
    }
    let store_max_connections = config.store_max_connections;
    let request_timeout = config.request_timeout;
    let (daily_limit, reserve_for_interactive) = (config.daily_limit, config.reserve_for_interactive);
    let config = Arc::new(RwLock::new(config));

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let redis_url = env::var("REDIS_URL").ok();

    let mut store = StoreWriter::connect(&database_url, store_max_connections)
        .await
        .expect("failed to connect to the analytic store");
    if let Some(redis_url) = &redis_url {
        match store.with_cache(redis_url).await {
            Ok(s) => store = s,
            Err(e) => warn!(error = %e, "cache unavailable, continuing without it"),
        }
    }
    let store = Arc::new(store);

    let accountant = if let Some(redis_url) = &redis_url {
        match Accountant::new(redis_url, daily_limit, reserve_for_interactive, Duration::from_secs(60)).await {
            Ok(a) => Arc::new(a),
            Err(e) => {
                warn!(error = %e, "redis unavailable for rate-limit accountant, falling back to in-memory");
                Arc::new(Accountant::new_in_memory(daily_limit, reserve_for_interactive, Duration::from_secs(60)))
            }
        }
    } else {
        Arc::new(Accountant::new_in_memory(daily_limit, reserve_for_interactive, Duration::from_secs(60)))
    };

    let queue = Arc::new(Queue::new());
    let monitor = Arc::new(Monitor::new());
    let client = Arc::new(CensusClient::new(request_timeout));

    let pool = Arc::new(WorkerPool::new(
        config.clone(),
        queue.clone(),
        accountant.clone(),
        store.clone(),
        monitor.clone(),
        client,
    ));
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), queue, accountant, monitor.clone(), pool));

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let tick_period = Duration::from_secs(5);
            let mut interval = tokio::time::interval(tick_period);
            let mut system = sysinfo::System::new_all();
            loop {
                interval.tick().await;
                orchestrator.expand_ready_phases();
                orchestrator.pump_once().await;
                orchestrator.advance_if_phase_complete();

                system.refresh_memory();
                let memory_usage_ratio = if system.total_memory() == 0 {
                    0.0
                } else {
                    system.used_memory() as f64 / system.total_memory() as f64
                };
                orchestrator.tick_health(memory_usage_ratio, tick_period);
            }
        });
    }

    let host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("SERVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8090);
    let workers: usize = env::var("WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or(4);

    info!(host = %host, port, "starting census ingestion control plane");

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(orchestrator.clone()))
            .configure(handlers::configure)
    })
    .workers(workers)
    .bind((host.as_str(), port))?
    .run()
    .await
}
