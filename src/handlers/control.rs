//! Consumer-facing control interface over HTTP: lifecycle, ad-hoc jobs,
//! progress, metrics, health, analytics, and config.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use validator::Validate;

use crate::config::ConfigPatch;
use crate::models::{ApiResponse, Geography, GeographyLevel};
use crate::monitor::REGISTRY;
use crate::orchestrator::Orchestrator;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/ingestion")
            .route("/start", web::post().to(start_loading))
            .route("/pause", web::post().to(pause))
            .route("/resume", web::post().to(resume))
            .route("/stop", web::post().to(stop))
            .route("/jobs", web::post().to(add_custom_job))
            .route("/progress", web::get().to(progress))
            .route("/health", web::get().to(health))
            .route("/analytics", web::get().to(analytics))
            .route("/config", web::get().to(get_config))
            .route("/config", web::patch().to(update_config)),
    )
    .route("/metrics", web::get().to(metrics_handler))
    .route("/healthz", web::get().to(liveness));
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub phases: Option<Vec<String>>,
}

async fn start_loading(orchestrator: web::Data<Arc<Orchestrator>>, body: Option<web::Json<StartRequest>>) -> impl Responder {
    let phases = body.and_then(|b| b.into_inner().phases);
    orchestrator.start_loading(phases).await;
    HttpResponse::Ok().json(ApiResponse::success(()))
}

async fn pause(orchestrator: web::Data<Arc<Orchestrator>>) -> impl Responder {
    orchestrator.pause();
    HttpResponse::Ok().json(ApiResponse::success(()))
}

async fn resume(orchestrator: web::Data<Arc<Orchestrator>>) -> impl Responder {
    orchestrator.resume();
    HttpResponse::Ok().json(ApiResponse::success(()))
}

async fn stop(orchestrator: web::Data<Arc<Orchestrator>>) -> impl Responder {
    orchestrator.stop().await;
    HttpResponse::Ok().json(ApiResponse::success(()))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddJobRequest {
    pub level: GeographyLevel,
    #[validate(length(max = 500, message = "too many geography codes in a single request"))]
    pub codes: Vec<String>,
    pub parent: Option<String>,
    #[validate(length(min = 1, max = 50, message = "must request between 1 and 50 variables"))]
    pub variables: Vec<String>,
    #[validate(range(min = 0, max = 100, message = "priority must be between 0 and 100"))]
    pub priority: Option<u8>,
}

async fn add_custom_job(orchestrator: web::Data<Arc<Orchestrator>>, body: web::Json<AddJobRequest>) -> impl Responder {
    let req = body.into_inner();
    if let Err(e) = req.validate() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string()));
    }
    let geography = Geography { level: req.level, codes: req.codes, parent: req.parent };
    let job_id = orchestrator.add_custom_job(geography, req.variables, req.priority);
    HttpResponse::Ok().json(ApiResponse::success(job_id))
}

async fn progress(orchestrator: web::Data<Arc<Orchestrator>>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(orchestrator.progress().await))
}

async fn health(orchestrator: web::Data<Arc<Orchestrator>>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(orchestrator.health()))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub window_hours: Option<u32>,
}

async fn analytics(orchestrator: web::Data<Arc<Orchestrator>>, query: web::Query<AnalyticsQuery>) -> impl Responder {
    let hours = query.window_hours.unwrap_or(24);
    let snapshots = orchestrator.health_history(hours);
    HttpResponse::Ok().json(ApiResponse::success(snapshots))
}

async fn get_config(orchestrator: web::Data<Arc<Orchestrator>>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(orchestrator.current_config()))
}

/// Applies a partial override, validated in-place: the merged config is
/// checked before it ever becomes live, so a bad field never takes effect.
async fn update_config(orchestrator: web::Data<Arc<Orchestrator>>, body: web::Json<ConfigPatch>) -> impl Responder {
    match orchestrator.update_config(body.into_inner()) {
        Ok(config) => HttpResponse::Ok().json(ApiResponse::success(config)),
        Err(e) => HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string())),
    }
}

async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}

async fn liveness() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}
