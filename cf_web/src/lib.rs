//! ABOUTME: Management API over tasks, executors, and executions
//! ABOUTME: Thin actix-web translation layer over the dispatch engine

use actix_web::{web, App, HttpServer};
use cf_bus::EventBus;
use cf_core::Result;
use cf_db::Db;
use cf_sched::{ExecutorClient, Scheduler, TaskRunner};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub mod error;
pub mod models;
pub mod routes;

pub use error::{ApiError, ApiResult};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub scheduler: Arc<Scheduler>,
    pub runner: Arc<TaskRunner>,
    pub bus: Arc<dyn EventBus>,
    /// True when the bus spans replicas (Redis); an in-process bus cannot
    /// forward work to the leader.
    pub bus_forwards: bool,
    pub client: ExecutorClient,
}

/// Run the management API server until shutdown
pub async fn start_server(
    bind_addr: &str,
    state: AppState,
    client_timeout: Duration,
) -> Result<()> {
    info!(addr = %bind_addr, "Starting management API server");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .client_request_timeout(client_timeout)
    .bind(bind_addr)
    .map_err(|e| cf_core::Error::Config(format!("Failed to bind {}: {}", bind_addr, e)))?
    .run()
    .await
    .map_err(|e| cf_core::Error::Io(e))
}
