use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub user: AuthUser,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Row of the `profiles` table, created by a database trigger after sign-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl Profile {
    pub fn new(user: &AuthUser, display_name: Option<String>) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            display_name,
        }
    }
}

/// What a sign-up produced. Without a session the provider is waiting on
/// email confirmation.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: AuthUser,
    pub session: Option<Session>,
}

impl Registration {
    pub fn confirmation_required(&self) -> bool {
        self.session.is_none()
    }
}
