//! ABOUTME: Task CRUD, pause/resume, and manual trigger endpoints
//! ABOUTME: Mutations publish reload-tasks so the leader refreshes its cron

use crate::error::{ApiError, ApiResult};
use crate::models::{CreateTaskBody, Note, TriggerBody, UpdateTaskBody};
use crate::AppState;
use actix_web::{web, HttpResponse};
use cf_bus::BusEvent;
use cf_db::{
    AssignmentRepository, CreateTaskRequest, TaskRepository, TaskStatus, UpdateTaskRequest,
};
use cf_sched::cron::validate_cron_expr;
use tracing::{info, warn};
use validator::Validate;

/// Publish a reload so the leader rebuilds its cron table; bus loss is
/// tolerable because cron state converges on the next leadership change.
async fn publish_reload(state: &AppState) {
    if let Err(e) = state.bus.publish(BusEvent::ReloadTasks).await {
        warn!("Failed to publish reload event: {}", e);
    }
}

pub async fn create(
    state: web::Data<AppState>,
    payload: web::Json<CreateTaskBody>,
) -> ApiResult<HttpResponse> {
    let body = payload.into_inner();
    body.validate()?;
    validate_cron_expr(&body.cron_expr).map_err(ApiError::from)?;

    let tasks = TaskRepository::new(state.db.pool());
    if tasks.find_by_name(&body.name).await?.is_some() {
        return Err(ApiError::conflict(format!(
            "Task named '{}' already exists",
            body.name
        )));
    }

    let task = tasks
        .create(CreateTaskRequest {
            name: body.name,
            cron_expr: body.cron_expr,
            parameters: body.parameters,
            execution_mode: body.execution_mode,
            lb_strategy: body.lb_strategy,
            max_retry: body.max_retry,
            timeout_seconds: body.timeout_seconds,
            status: body.status,
        })
        .await?;

    let assignments = AssignmentRepository::new(state.db.pool());
    for assignment in &body.assignments {
        assignments
            .ensure(
                &task.id,
                &assignment.executor_name,
                assignment.priority,
                assignment.weight,
            )
            .await?;
    }

    info!(task = %task.name, "Task created");
    publish_reload(&state).await;
    Ok(HttpResponse::Created().json(task))
}

pub async fn list(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let tasks = TaskRepository::new(state.db.pool()).list().await?;
    Ok(HttpResponse::Ok().json(tasks))
}

pub async fn get(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let task = TaskRepository::new(state.db.pool())
        .find_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Task {}", id)))?;
    Ok(HttpResponse::Ok().json(task))
}

pub async fn update(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateTaskBody>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let body = payload.into_inner();

    if let Some(expr) = &body.cron_expr {
        validate_cron_expr(expr).map_err(ApiError::from)?;
    }

    let task = TaskRepository::new(state.db.pool())
        .update(
            &id,
            UpdateTaskRequest {
                cron_expr: body.cron_expr,
                parameters: body.parameters,
                execution_mode: body.execution_mode,
                lb_strategy: body.lb_strategy,
                max_retry: body.max_retry,
                timeout_seconds: body.timeout_seconds,
            },
        )
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Task {}", id)))?;

    publish_reload(&state).await;
    Ok(HttpResponse::Ok().json(task))
}

pub async fn delete(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let deleted = TaskRepository::new(state.db.pool()).soft_delete(&id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("Task {}", id)));
    }
    info!(task_id = %id, "Task deleted");
    publish_reload(&state).await;
    Ok(HttpResponse::Ok().json(Note::new("task deleted")))
}

async fn set_status(state: &AppState, id: &str, status: TaskStatus) -> ApiResult<HttpResponse> {
    let changed = TaskRepository::new(state.db.pool())
        .set_status(id, status)
        .await?;
    if !changed {
        return Err(ApiError::not_found(format!("Task {}", id)));
    }
    publish_reload(state).await;
    Ok(HttpResponse::Ok().json(Note::new(format!("task {}", status.as_str()))))
}

pub async fn pause(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    set_status(&state, &path.into_inner(), TaskStatus::Paused).await
}

pub async fn resume(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    set_status(&state, &path.into_inner(), TaskStatus::Active).await
}

/// Manual trigger. On the leader the execution is created inline; on a
/// follower the event is forwarded when a cross-replica bus is configured,
/// otherwise the caller gets a 202 with a not-leader note instead of a 5xx.
pub async fn trigger(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<TriggerBody>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let parameters = payload.into_inner().parameters;

    if state.scheduler.is_leader() {
        let message = match state.scheduler.submit_new_task(&id, parameters).await? {
            Some(execution) => format!("execution {} scheduled", execution.id),
            None => "firing dropped by execution mode policy".to_string(),
        };
        return Ok(HttpResponse::Accepted().json(Note::new(message)));
    }

    if state.bus_forwards {
        state
            .bus
            .publish(BusEvent::SubmitTask {
                task_id: id,
                parameters,
            })
            .await?;
        return Ok(HttpResponse::Accepted().json(Note::new("forwarded to leader")));
    }

    Ok(HttpResponse::Accepted().json(Note::new(
        "this replica is not the leader and no event bus is configured; trigger was not scheduled",
    )))
}
