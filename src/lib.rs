pub mod auth;
pub mod backend;
pub mod config;
pub mod error;

use std::sync::Arc;
use actix_web::{web, HttpResponse};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

pub use auth::{AuthService, RateLimiter, RateLimitConfig, RateLimitStatus};
pub use backend::{AuthBackend, SupabaseClient};

/// Health check endpoint handler
/// Returns a JSON response with server status, environment and timestamp
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "environment": state.config.environment,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Mounts every route the gateway serves.
pub fn routes(cfg: &mut web::ServiceConfig) {
    use auth::handlers::{login, logout, register};

    cfg.route("/health", web::get().to(health_check))
        .route("/auth/login", web::post().to(login))
        .route("/auth/register", web::post().to(register))
        .route("/auth/logout", web::post().to(logout));
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth_service: Arc<AuthService>,
}

impl AppState {
    pub fn new(config: Settings) -> Result<Self> {
        let backend = SupabaseClient::from_config(&config.supabase)?;
        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    pub fn with_backend(config: Settings, backend: Arc<dyn AuthBackend>) -> Self {
        let auth_service = AuthService::new(
            backend,
            RateLimiter::new(config.rate_limit.login.clone()),
            RateLimiter::new(config.rate_limit.registration.clone()),
            (&config.auth).into(),
        );

        Self {
            config: Arc::new(config),
            auth_service: Arc::new(auth_service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_creation() {
        let config = Settings::new_for_test().expect("Failed to load test config");
        let state = AppState::new(config).expect("Failed to build state");

        assert_eq!(state.auth_service.login_limiter().config().max_attempts, 5);
        assert_eq!(state.auth_service.registration_limiter().config().max_attempts, 3);
    }

    #[test]
    fn test_app_state_rejects_bad_supabase_url() {
        let mut config = Settings::new_for_test().expect("Failed to load test config");
        config.supabase.url = "::not-a-url".into();

        let state = AppState::new(config);
        assert!(matches!(state, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_app_state_clone() {
        let config = Settings::new_for_test().expect("Failed to load test config");
        let state = AppState::new(config).expect("Failed to build state");

        let cloned = state.clone();

        // Clones share the same limiters.
        assert!(Arc::ptr_eq(&state.config, &cloned.config));
        assert!(Arc::ptr_eq(&state.auth_service, &cloned.auth_service));
    }
}
