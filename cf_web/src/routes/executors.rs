//! ABOUTME: Executor registration and lifecycle endpoints
//! ABOUTME: Registration guards against displacing a live executor

use crate::error::{ApiError, ApiResult};
use crate::models::{Note, RegisterBody};
use crate::AppState;
use actix_web::{web, HttpResponse};
use cf_bus::BusEvent;
use cf_db::{
    AssignmentRepository, CreateTaskRequest, ExecutionMode, ExecutorRepository, ExecutorStatus,
    LbStrategy, RegisterExecutor, TaskRepository, TaskStatus,
};
use cf_sched::cron::validate_cron_expr;
use tracing::{info, warn};
use validator::Validate;

/// Register or refresh an executor instance. Re-registering the same
/// (instance_id, base_url) converges to one row; a live online executor
/// cannot be displaced by the same instance_id at a different location.
pub async fn register(
    state: web::Data<AppState>,
    payload: web::Json<RegisterBody>,
) -> ApiResult<HttpResponse> {
    let body = payload.into_inner();
    body.validate()?;

    let executors = ExecutorRepository::new(state.db.pool());

    if let Some(existing) = executors.find_by_instance_id(&body.instance_id).await? {
        if existing.status == ExecutorStatus::Online && existing.base_url != body.base_url {
            return Err(ApiError::conflict(format!(
                "Executor instance {} is online at {}; refusing registration from {}",
                body.instance_id, existing.base_url, body.base_url
            )));
        }
    }

    let executor = executors
        .upsert(RegisterExecutor {
            instance_id: body.instance_id,
            name: body.name,
            base_url: body.base_url,
            health_url: body.health_url,
            metadata: body.metadata,
        })
        .await?;

    // Auto-create unknown tasks (paused unless the worker asks for active)
    // and bind them to this executor's name.
    let tasks = TaskRepository::new(state.db.pool());
    let assignments = AssignmentRepository::new(state.db.pool());
    let mut created_any = false;
    for spec in &body.tasks {
        let task = match tasks.find_by_name(&spec.name).await? {
            Some(task) => task,
            None => {
                let Some(cron_expr) = spec.cron_expr.clone() else {
                    warn!(
                        task = %spec.name,
                        executor = %executor.instance_id,
                        "Registration names unknown task without a cron expression, skipping"
                    );
                    continue;
                };
                validate_cron_expr(&cron_expr).map_err(ApiError::from)?;
                let status = if spec.active {
                    TaskStatus::Active
                } else {
                    TaskStatus::Paused
                };
                created_any = true;
                tasks
                    .create(CreateTaskRequest {
                        name: spec.name.clone(),
                        cron_expr,
                        parameters: serde_json::json!({}),
                        execution_mode: ExecutionMode::Parallel,
                        lb_strategy: LbStrategy::RoundRobin,
                        max_retry: 0,
                        timeout_seconds: 0,
                        status,
                    })
                    .await?
            }
        };
        assignments
            .ensure(&task.id, &executor.name, spec.priority, spec.weight)
            .await?;
    }

    info!(
        executor = %executor.instance_id,
        name = %executor.name,
        tasks = body.tasks.len(),
        "Executor registered"
    );

    if created_any {
        if let Err(e) = state.bus.publish(BusEvent::ReloadTasks).await {
            warn!("Failed to publish reload event: {}", e);
        }
    }

    Ok(HttpResponse::Ok().json(executor))
}

pub async fn list(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let executors = ExecutorRepository::new(state.db.pool()).list().await?;
    Ok(HttpResponse::Ok().json(executors))
}

pub async fn get(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let executor = ExecutorRepository::new(state.db.pool())
        .find_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Executor {}", id)))?;
    Ok(HttpResponse::Ok().json(executor))
}

pub async fn delete(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let deleted = ExecutorRepository::new(state.db.pool()).delete(&id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("Executor {}", id)));
    }
    state.runner.remove_breaker(&id);
    info!(executor_id = %id, "Executor removed");
    Ok(HttpResponse::Ok().json(Note::new("executor removed")))
}

async fn set_status(
    state: &AppState,
    id: &str,
    status: ExecutorStatus,
) -> ApiResult<HttpResponse> {
    let changed = ExecutorRepository::new(state.db.pool())
        .set_status(id, status)
        .await?;
    if !changed {
        return Err(ApiError::not_found(format!("Executor {}", id)));
    }
    Ok(HttpResponse::Ok().json(Note::new(format!("executor {}", status.as_str()))))
}

/// Park an executor; the health checker stops probing it
pub async fn maintenance(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    set_status(&state, &path.into_inner(), ExecutorStatus::Maintenance).await
}

/// Bring a parked executor back online
pub async fn activate(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    set_status(&state, &path.into_inner(), ExecutorStatus::Online).await
}
