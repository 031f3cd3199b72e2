//! ABOUTME: Route table for the management API
//! ABOUTME: Health, tasks, executors, executions, and stats endpoints

use crate::error::ApiResult;
use crate::AppState;
use actix_web::{web, HttpResponse, Result as ActixResult};
use cf_db::InstanceRepository;
use serde_json::json;

pub mod executions;
pub mod executors;
pub mod tasks;

/// Liveness endpoint
pub async fn health(state: web::Data<AppState>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.scheduler.instance_id(),
        "is_leader": state.scheduler.is_leader(),
    })))
}

/// All scheduler replicas known to the cluster
pub async fn instances(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let instances = InstanceRepository::new(state.db.pool()).list().await?;
    Ok(HttpResponse::Ok().json(instances))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health)).service(
        web::scope("/api")
            .service(
                web::scope("/tasks")
                    .route("", web::post().to(tasks::create))
                    .route("", web::get().to(tasks::list))
                    .route("/{id}", web::get().to(tasks::get))
                    .route("/{id}", web::put().to(tasks::update))
                    .route("/{id}", web::delete().to(tasks::delete))
                    .route("/{id}/pause", web::post().to(tasks::pause))
                    .route("/{id}/resume", web::post().to(tasks::resume))
                    .route("/{id}/trigger", web::post().to(tasks::trigger)),
            )
            .service(
                web::scope("/executors")
                    .route("/register", web::post().to(executors::register))
                    .route("", web::get().to(executors::list))
                    .route("/{id}", web::get().to(executors::get))
                    .route("/{id}", web::delete().to(executors::delete))
                    .route("/{id}/maintenance", web::post().to(executors::maintenance))
                    .route("/{id}/activate", web::post().to(executors::activate)),
            )
            .service(
                web::scope("/executions")
                    .route("", web::get().to(executions::list))
                    .route("/{id}", web::get().to(executions::get))
                    .route("/{id}/callback", web::post().to(executions::callback))
                    .route("/{id}/stop", web::post().to(executions::stop)),
            )
            .route("/stats/executions", web::get().to(executions::stats))
            .route("/instances", web::get().to(instances)),
    );
}
