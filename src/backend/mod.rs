//! Identity provider access for the auth gateway
//!
//! `AuthBackend` is the seam the auth service talks through; `SupabaseClient`
//! implements it over Supabase Auth and the `profiles` REST table.

pub mod models;
pub mod supabase;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
pub use models::{AuthUser, Profile, Registration, Session};
pub use supabase::SupabaseClient;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AppError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<String>,
    ) -> Result<Registration, AppError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AppError>;

    /// `access_token` is used for row-level security when present.
    async fn fetch_profile(
        &self,
        user_id: Uuid,
        access_token: Option<String>,
    ) -> Result<Option<Profile>, AppError>;

    async fn create_profile(
        &self,
        profile: Profile,
        access_token: Option<String>,
    ) -> Result<(), AppError>;
}
