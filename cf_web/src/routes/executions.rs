//! ABOUTME: Execution listing, worker callbacks, and operator stop
//! ABOUTME: Callbacks finalize the row and cancel the timeout timer

use crate::error::{ApiError, ApiResult};
use crate::models::{CallbackBody, ExecutionsQuery, Note};
use crate::AppState;
use actix_web::{web, HttpResponse};
use cf_bus::BusEvent;
use cf_db::{ExecutionFilter, ExecutionRepository, ExecutionStatus, ExecutorRepository};
use tracing::{info, warn};

pub async fn list(
    state: web::Data<AppState>,
    query: web::Query<ExecutionsQuery>,
) -> ApiResult<HttpResponse> {
    let query = query.into_inner();
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<ExecutionStatus>().map_err(ApiError::from)?),
        None => None,
    };

    let executions = ExecutionRepository::new(state.db.pool())
        .list(ExecutionFilter {
            task_id: query.task_id,
            status,
            limit: query.limit.unwrap_or(100),
        })
        .await?;
    Ok(HttpResponse::Ok().json(executions))
}

pub async fn get(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let execution = ExecutionRepository::new(state.db.pool())
        .find_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Execution {}", id)))?;
    Ok(HttpResponse::Ok().json(execution))
}

/// Worker-originated terminal notification. The terminal guard makes a
/// duplicate or late callback a silent no-op; the timer cancel is published
/// either way because any replica may own the timer.
pub async fn callback(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<CallbackBody>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let body = payload.into_inner();

    let status = body
        .status
        .parse::<ExecutionStatus>()
        .map_err(ApiError::from)?;
    if !status.is_terminal() {
        return Err(ApiError::bad_request(format!(
            "Callback status must be terminal, got '{}'",
            status.as_str()
        )));
    }

    let executions = ExecutionRepository::new(state.db.pool());
    let execution = executions
        .find_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Execution {}", id)))?;

    let updated = executions
        .finalize(
            &execution.id,
            status,
            body.result,
            body.logs.as_deref().unwrap_or(""),
        )
        .await?;

    if let Err(e) = state
        .bus
        .publish(BusEvent::CancelExecutionTimer {
            execution_id: execution.id.clone(),
        })
        .await
    {
        warn!(execution = %execution.id, "Failed to publish timer cancel: {}", e);
    }

    if updated {
        info!(execution = %execution.id, status = status.as_str(), "Callback applied");
        Ok(HttpResponse::Ok().json(Note::new("callback applied")))
    } else {
        Ok(HttpResponse::Ok().json(Note::new("execution already terminal")))
    }
}

/// Operator-initiated stop: tell the assigned executor, then mark the
/// execution cancelled.
pub async fn stop(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let executions = ExecutionRepository::new(state.db.pool());
    let execution = executions
        .find_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Execution {}", id)))?;

    if execution.status.is_terminal() {
        return Err(ApiError::bad_request(format!(
            "Execution {} is already {}",
            id,
            execution.status.as_str()
        )));
    }

    if let Some(executor_id) = &execution.executor_id {
        if let Some(executor) = ExecutorRepository::new(state.db.pool())
            .find_by_id(executor_id)
            .await?
        {
            if let Err(e) = state.client.stop(&executor, &execution.id).await {
                warn!(execution = %execution.id, "Stop call to executor failed: {}", e);
            }
        }
    }

    executions
        .finalize(
            &execution.id,
            ExecutionStatus::Cancelled,
            None,
            "stopped by operator",
        )
        .await?;

    if let Err(e) = state
        .bus
        .publish(BusEvent::CancelExecutionTimer {
            execution_id: execution.id.clone(),
        })
        .await
    {
        warn!(execution = %execution.id, "Failed to publish timer cancel: {}", e);
    }

    info!(execution = %execution.id, "Execution stopped by operator");
    Ok(HttpResponse::Ok().json(Note::new("execution cancelled")))
}

/// Execution counts by status. Skipped executions are their own bucket and
/// never count toward success or failure rates.
pub async fn stats(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let counts = ExecutionRepository::new(state.db.pool())
        .status_counts()
        .await?;
    Ok(HttpResponse::Ok().json(counts))
}
