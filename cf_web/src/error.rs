//! ABOUTME: Error handling utilities for RFC 7807 Problem Details responses
//! ABOUTME: Converts engine and validation errors to standardized format

use crate::models::ProblemDetails;
use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use validator::ValidationErrors;

/// API error wrapper for RFC 7807 Problem Details
#[derive(Debug)]
pub struct ApiError {
    pub problem: ProblemDetails,
    pub status_code: u16,
}

impl ApiError {
    pub fn new(problem: ProblemDetails) -> Self {
        let status_code = problem.status.unwrap_or(500);
        Self {
            problem,
            status_code,
        }
    }

    /// Create a bad request error
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(ProblemDetails::bad_request(detail.into()))
    }

    /// Create a not found error
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ProblemDetails::not_found(detail.into()))
    }

    /// Create a conflict error
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ProblemDetails::conflict(detail.into()))
    }

    /// Create an internal server error
    pub fn internal_server_error(detail: impl Into<String>) -> Self {
        Self::new(ProblemDetails::internal(detail.into()))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.problem.title,
            self.problem
                .detail
                .as_deref()
                .unwrap_or("No details available")
        )
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.status_code)
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("application/problem+json")
            .json(&self.problem)
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        Self::bad_request(format!("Request validation failed: {}", errors))
    }
}

/// Convert cf_core::Error to ApiError
impl From<cf_core::Error> for ApiError {
    fn from(error: cf_core::Error) -> Self {
        match error {
            cf_core::Error::NotFound(msg) => Self::not_found(msg),
            cf_core::Error::Validation(msg) => Self::bad_request(msg),
            cf_core::Error::NotLeader(instance) => {
                // Routes that can forward handle NotLeader themselves; this
                // path is the generic fallback.
                Self::conflict(format!("Replica {} is not the leader", instance))
            }
            cf_core::Error::Database(msg) => {
                Self::internal_server_error(format!("Database error: {}", msg))
            }
            cf_core::Error::Config(msg) => {
                Self::internal_server_error(format!("Configuration error: {}", msg))
            }
            cf_core::Error::Dispatch(msg) => {
                Self::internal_server_error(format!("Dispatch error: {}", msg))
            }
            cf_core::Error::CircuitOpen(executor) => {
                Self::internal_server_error(format!("Circuit open for executor {}", executor))
            }
            cf_core::Error::Bus(msg) => {
                Self::internal_server_error(format!("Event bus error: {}", msg))
            }
            cf_core::Error::Io(e) => Self::internal_server_error(format!("IO error: {}", e)),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::bad_request("bad").status_code, 400);
        assert_eq!(ApiError::not_found("missing").status_code, 404);
        assert_eq!(ApiError::conflict("taken").status_code, 409);
        assert_eq!(ApiError::internal_server_error("boom").status_code, 500);
    }

    #[test]
    fn test_core_error_mapping() {
        let api: ApiError = cf_core::Error::NotFound("task x".to_string()).into();
        assert_eq!(api.status_code, 404);

        let api: ApiError = cf_core::Error::Validation("bad cron".to_string()).into();
        assert_eq!(api.status_code, 400);

        let api: ApiError = cf_core::Error::Database("down".to_string()).into();
        assert_eq!(api.status_code, 500);

        let api: ApiError = cf_core::Error::NotLeader("host:1".to_string()).into();
        assert_eq!(api.status_code, 409);
    }
}
