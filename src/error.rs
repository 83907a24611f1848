use std::time::Duration;
use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::{header, StatusCode}};
use serde_json::json;

use crate::auth::format_remaining_time;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Backend error: {0}")]
    BackendError(#[from] BackendError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::ConfigError(format!("invalid url: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::BackendError(BackendError::InvalidResponse(err.to_string()))
        } else {
            AppError::BackendError(BackendError::RequestFailed(err.to_string()))
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let mut error = json!({
            "status": status.as_u16(),
            "message": self.to_string(),
        });

        let mut builder = HttpResponse::build(status);
        match self {
            AppError::AuthError(AuthError::InvalidCredentials { remaining_attempts: Some(left) }) => {
                error["remaining_attempts"] = json!(left);
            }
            AppError::AuthError(AuthError::RateLimited { retry_after }) => {
                let secs = retry_after_secs(retry_after);
                error["retry_after_secs"] = json!(secs);
                builder.insert_header((header::RETRY_AFTER, secs.to_string()));
            }
            _ => {}
        }

        builder.json(json!({ "error": error }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
                AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
                AuthError::SessionExpired => StatusCode::UNAUTHORIZED,
                AuthError::RegistrationRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
                AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            },
            AppError::BackendError(_) => StatusCode::BAD_GATEWAY,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn retry_after_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs }
}

fn wait_message(retry_after: &Duration) -> String {
    format_remaining_time(*retry_after)
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials { remaining_attempts: Option<u32> },

    #[error("Too many attempts. Please try again in {}", wait_message(.retry_after))]
    RateLimited { retry_after: Duration },

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Session expired")]
    SessionExpired,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Identity provider rate limited the request")]
    RateLimited,

    #[error("Unexpected response ({status}): {message}")]
    ResponseError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
