use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::models::{AuthUser, Profile, Registration, Session};
use super::AuthBackend;
use crate::config::SupabaseConfig;
use crate::error::{AppError, AuthError, BackendError};

/// Lifetime GoTrue hands out when a token response carries no expiry.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: Url,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(url: &str, anon_key: String, timeout: std::time::Duration) -> Result<Self, AppError> {
        // Url::join drops the last path segment unless the base ends with a slash.
        let mut base_url = Url::parse(url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { http, base_url, anon_key })
    }

    pub fn from_config(config: &SupabaseConfig) -> Result<Self, AppError> {
        Self::new(
            &config.url,
            config.anon_key.clone(),
            std::time::Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        Ok(self.base_url.join(path)?)
    }

    async fn unexpected(&self, response: Response) -> AppError {
        let status = response.status();
        let message = provider_message(response).await;
        warn!("Unexpected identity provider response {}: {}", status, message);
        BackendError::ResponseError { status: status.as_u16(), message }.into()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: AuthUser,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| {
                let ttl = self.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
                Utc::now() + Duration::seconds(ttl)
            });

        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            expires_at,
            user: self.user,
        }
    }
}

/// Sign-up answers with a full session when auto-confirm is on, and with the
/// bare user when email confirmation is pending.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

/// GoTrue and PostgREST disagree on where the human message lives.
#[derive(Debug, Default, Deserialize)]
struct ProviderError {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ProviderError {
    fn into_message(self) -> Option<String> {
        self.msg
            .or(self.message)
            .or(self.error_description)
            .or(self.error)
    }
}

async fn provider_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    serde_json::from_str::<ProviderError>(&body)
        .ok()
        .and_then(ProviderError::into_message)
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string())
}

#[async_trait]
impl AuthBackend for SupabaseClient {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AppError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");

        let response = self.http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let token: TokenResponse = response.json().await?;
                Ok(token.into_session())
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                debug!("Identity provider rejected credentials for {}", email);
                Err(AuthError::InvalidCredentials { remaining_attempts: None }.into())
            }
            StatusCode::TOO_MANY_REQUESTS => Err(BackendError::RateLimited.into()),
            _ => Err(self.unexpected(response).await),
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<String>,
    ) -> Result<Registration, AppError> {
        let url = self.endpoint("auth/v1/signup")?;

        let response = self.http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&json!({
                "email": email,
                "password": password,
                "data": { "display_name": display_name },
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(match response.json::<SignUpResponse>().await? {
                SignUpResponse::Session(token) => {
                    let session = token.into_session();
                    Registration { user: session.user.clone(), session: Some(session) }
                }
                SignUpResponse::User(user) => Registration { user, session: None },
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited.into());
        }
        if status.is_client_error() {
            let message = provider_message(response).await;
            return Err(AuthError::RegistrationRejected(message).into());
        }
        Err(self.unexpected(response).await)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AppError> {
        let url = self.endpoint("auth/v1/logout")?;

        let response = self.http
            .post(url)
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidToken.into()),
            _ => Err(self.unexpected(response).await),
        }
    }

    async fn fetch_profile(
        &self,
        user_id: Uuid,
        access_token: Option<String>,
    ) -> Result<Option<Profile>, AppError> {
        let mut url = self.endpoint("rest/v1/profiles")?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{}", user_id))
            .append_pair("select", "id,email,display_name");

        let response = self.http
            .get(url)
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token.as_deref().unwrap_or(&self.anon_key))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.unexpected(response).await);
        }

        let rows: Vec<Profile> = response.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn create_profile(
        &self,
        profile: Profile,
        access_token: Option<String>,
    ) -> Result<(), AppError> {
        let url = self.endpoint("rest/v1/profiles")?;

        let response = self.http
            .post(url)
            .header("apikey", &self.anon_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(access_token.as_deref().unwrap_or(&self.anon_key))
            .json(&profile)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // The trigger won the race.
            StatusCode::CONFLICT => {
                debug!("Profile {} already exists", profile.id);
                Ok(())
            }
            _ => Err(self.unexpected(response).await),
        }
    }
}
