//! Worker pool scenario tests against a stubbed statistical service.
//! Store-backed scenarios require a reachable Postgres instance via
//! `TEST_DATABASE_URL`/`DATABASE_URL` and are skipped (not failed) otherwise,
//! matching how this codebase already treats optional integration infra.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use census_ingest::census_client::{CensusClient, CensusQuery};
use census_ingest::config::Config;
use census_ingest::models::{Geography, GeographyLevel};
use census_ingest::monitor::Monitor;
use census_ingest::queue::Queue;
use census_ingest::rate_limit::Accountant;
use census_ingest::store::StoreWriter;
use census_ingest::worker::WorkerPool;

async fn test_store() -> Option<Arc<StoreWriter>> {
    dotenvy::dotenv().ok();
    let url = std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")).ok()?;
    StoreWriter::connect(&url, 5).await.ok().map(Arc::new)
}

fn query_for(server: &MockServer) -> CensusQuery {
    CensusQuery {
        dataset_base_url: format!("{}/data/2023/acs/acs5", server.uri()),
        variables: vec!["B01003_001E".to_string()],
        level: GeographyLevel::State,
        codes: vec![],
        parent: None,
        api_key: None,
        year: 2023,
        dataset: "acs5".to_string(),
    }
}

/// A well-formed envelope is fetched and parsed into one record per
/// data row.
#[tokio::test]
async fn foundation_phase_happy_path() {
    let server = MockServer::start().await;
    let body = json!([
        ["NAME", "B01003_001E", "state"],
        ["California", "39000000", "06"],
    ]);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let client = CensusClient::new(Duration::from_secs(5));
    let records = client.fetch(&query_for(&server)).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].geography_code, "06");
}

/// A transient transport flake (503) on the first call surfaces as an
/// error without panicking; a retry against the now-healthy endpoint
/// succeeds.
#[tokio::test]
async fn transient_flake_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let body = json!([
        ["NAME", "B01003_001E", "state"],
        ["Texas", "30000000", "48"],
    ]);
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200).set_body_json(body)).mount(&server).await;

    let client = CensusClient::new(Duration::from_secs(5));
    let query = query_for(&server);

    let first = client.fetch(&query).await;
    assert!(first.is_err());

    let second = client.fetch(&query).await.unwrap();
    assert_eq!(second[0].geography_code, "48");
}

/// A non-array-of-arrays body is rejected without panicking, surfaced
/// as a malformed-response error.
#[tokio::test]
async fn malformed_response_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": "shape"})))
        .mount(&server)
        .await;

    let client = CensusClient::new(Duration::from_secs(5));
    let result = client.fetch(&query_for(&server)).await;
    assert!(result.is_err());
}

/// A paused pool reports `is_paused()` true; resuming clears the flag.
#[tokio::test]
async fn pause_and_resume_toggles_dispatch() {
    let Some(store) = test_store().await else {
        eprintln!("skipping pause_and_resume_toggles_dispatch: no reachable test database");
        return;
    };

    let config = Config::default();
    let accountant = Arc::new(Accountant::new_in_memory(config.daily_limit, config.reserve_for_interactive, Duration::from_secs(60)));
    let client = Arc::new(CensusClient::new(config.request_timeout));
    let config = Arc::new(RwLock::new(config));
    let queue = Arc::new(Queue::new());
    let monitor = Arc::new(Monitor::new());
    let pool = WorkerPool::new(config, queue, accountant, store, monitor, client);

    assert!(!pool.is_paused());
    pool.pause();
    assert!(pool.is_paused());
    pool.resume();
    assert!(!pool.is_paused());
}

#[tokio::test]
async fn geography_all_state_has_no_explicit_codes() {
    let geography = Geography::all(GeographyLevel::State);
    assert!(geography.is_wildcard());
}
