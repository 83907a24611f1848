use actix_web::{web, HttpResponse, HttpRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::AppState;
use crate::backend::Session;
use crate::error::{AppError, AuthError};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Uuid,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            token_type: session.token_type,
            expires_at: session.expires_at,
            user_id: session.user.id,
        }
    }
}

pub async fn login(
    req: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!("Received login request for email: {}", req.email);
    match state.auth_service.login(&req.email, &req.password).await {
        Ok(session) => {
            info!("Login successful for email: {}", req.email);
            Ok(HttpResponse::Ok().json(SessionResponse::from(session)))
        }
        Err(e) => {
            warn!("Login failed for email: {}: {}", req.email, e);
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub confirmation_required: bool,
    pub session: Option<SessionResponse>,
}

pub async fn register(
    req: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!("Received registration request for email: {}", req.email);

    let registration = match state.auth_service.register(
        &req.email,
        &req.password,
        req.display_name.as_deref(),
    ).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!("Registration failed for email: {}: {}", req.email, e);
            return Err(e);
        }
    };

    info!(
        "Registration successful for email: {} (confirmation required: {})",
        req.email,
        registration.confirmation_required()
    );

    Ok(HttpResponse::Created().json(RegisterResponse {
        user_id: registration.user.id,
        confirmation_required: registration.confirmation_required(),
        session: registration.session.map(SessionResponse::from),
    }))
}

pub async fn logout(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let token = req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AuthError::InvalidToken)?;

    state.auth_service.logout(token).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Successfully logged out"
    })))
}
