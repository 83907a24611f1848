use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{AuthBackend, Profile, Registration, Session};
use crate::config::AuthConfig;
use crate::error::{AppError, AuthError};
use super::rate_limit::{AttemptPermit, RateLimiter};

/// Lowercases and trims an email so every spelling of an address shares one
/// attempt record.
pub fn normalize_identifier(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileBootstrap {
    pub poll_attempts: u32,
    pub poll_delay: Duration,
}

impl From<&AuthConfig> for ProfileBootstrap {
    fn from(config: &AuthConfig) -> Self {
        Self {
            poll_attempts: config.profile_poll_attempts,
            poll_delay: Duration::from_millis(config.profile_poll_delay_ms),
        }
    }
}

pub struct AuthService {
    backend: Arc<dyn AuthBackend>,
    login_limiter: RateLimiter,
    registration_limiter: RateLimiter,
    bootstrap: ProfileBootstrap,
}

impl AuthService {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        login_limiter: RateLimiter,
        registration_limiter: RateLimiter,
        bootstrap: ProfileBootstrap,
    ) -> Self {
        Self {
            backend,
            login_limiter,
            registration_limiter,
            bootstrap,
        }
    }

    pub fn login_limiter(&self) -> &RateLimiter {
        &self.login_limiter
    }

    pub fn registration_limiter(&self) -> &RateLimiter {
        &self.registration_limiter
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AppError> {
        let identifier = validate_credentials(email, password)?;
        let permit = acquire(&self.login_limiter, &identifier)?;

        // Unsettled permits (expired session, provider outage) release their slot on drop.
        match self.backend.sign_in(&identifier, password).await {
            Ok(session) => {
                if session.is_expired() {
                    return Err(AuthError::SessionExpired.into());
                }
                permit.succeed();
                Ok(session)
            }
            Err(AppError::AuthError(AuthError::InvalidCredentials { .. })) => {
                Err(record_failure(&self.login_limiter, permit, |remaining| {
                    AuthError::InvalidCredentials { remaining_attempts: Some(remaining) }
                }))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Registration, AppError> {
        let identifier = validate_credentials(email, password)?;
        let permit = acquire(&self.registration_limiter, &identifier)?;

        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let registration = match self.backend
            .sign_up(&identifier, password, display_name.clone())
            .await
        {
            Ok(registration) => registration,
            Err(AppError::AuthError(AuthError::RegistrationRejected(reason))) => {
                return Err(record_failure(&self.registration_limiter, permit, |_| {
                    AuthError::RegistrationRejected(reason)
                }));
            }
            Err(e) => return Err(e),
        };

        permit.succeed();
        self.ensure_profile(&registration, display_name).await?;

        Ok(registration)
    }

    pub async fn logout(&self, access_token: &str) -> Result<(), AppError> {
        if access_token.trim().is_empty() {
            return Err(AuthError::InvalidToken.into());
        }
        self.backend.sign_out(access_token).await
    }

    /// Waits for the sign-up trigger to create the profile row, then creates it
    /// directly if it never shows up.
    async fn ensure_profile(
        &self,
        registration: &Registration,
        display_name: Option<String>,
    ) -> Result<(), AppError> {
        let user_id = registration.user.id;
        let access_token = registration.session.as_ref().map(|s| s.access_token.clone());

        for attempt in 1..=self.bootstrap.poll_attempts {
            if self.backend.fetch_profile(user_id, access_token.clone()).await?.is_some() {
                debug!("Profile {} found after {} poll(s)", user_id, attempt);
                return Ok(());
            }
            if attempt < self.bootstrap.poll_attempts {
                tokio::time::sleep(self.bootstrap.poll_delay * attempt).await;
            }
        }

        warn!(
            "Profile {} missing after {} polls, creating it",
            user_id, self.bootstrap.poll_attempts
        );
        let profile = Profile::new(&registration.user, display_name);
        self.backend.create_profile(profile, access_token).await
    }

    /// Evicts limiter records that no longer hold any state worth keeping.
    pub fn purge_expired(&self) -> usize {
        self.login_limiter.purge_expired() + self.registration_limiter.purge_expired()
    }
}

fn validate_credentials(email: &str, password: &str) -> Result<String, AppError> {
    let identifier = normalize_identifier(email);
    if identifier.is_empty() {
        return Err(AppError::ValidationError("email is required".into()));
    }
    if password.is_empty() {
        return Err(AppError::ValidationError("password is required".into()));
    }
    Ok(identifier)
}

/// Reserves an attempt slot, or explains how long the caller has to wait.
fn acquire<'a>(limiter: &'a RateLimiter, identifier: &str) -> Result<AttemptPermit<'a>, AppError> {
    limiter.try_acquire(identifier).map_err(|denied| {
        info!("Rejecting attempt for {}: {:?}", identifier, denied);
        AuthError::RateLimited { retry_after: denied.retry_after() }.into()
    })
}

/// Records a failed attempt. Returns the lockout error if this failure tripped
/// the limit, otherwise the error built from the attempts left.
fn record_failure<F>(limiter: &RateLimiter, permit: AttemptPermit<'_>, on_failure: F) -> AppError
where
    F: FnOnce(u32) -> AuthError,
{
    let identifier = permit.identifier().to_string();
    let identifier = identifier.as_str();
    permit.fail();

    let status = limiter.is_rate_limited(identifier);
    if status.limited {
        return AuthError::RateLimited {
            retry_after: status.remaining_time.unwrap_or_default(),
        }
        .into();
    }

    let remaining = limiter.remaining_attempts(identifier);
    info!("Failed attempt for {}, {} remaining", identifier, remaining);
    on_failure(remaining).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::rate_limit::RateLimitConfig;
    use crate::backend::{AuthUser, MockAuthBackend};
    use chrono::Utc;
    use uuid::Uuid;

    fn session(email: &str) -> Session {
        Session {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            token_type: "bearer".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            user: AuthUser { id: Uuid::new_v4(), email: Some(email.into()) },
        }
    }

    fn service(backend: MockAuthBackend, poll_attempts: u32) -> (AuthService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let login = RateLimiter::with_clock(
            RateLimitConfig { max_attempts: 3, window_ms: 60_000, lockout_ms: 60_000 },
            clock.clone(),
        );
        let registration = RateLimiter::with_clock(
            RateLimitConfig { max_attempts: 2, window_ms: 60_000, lockout_ms: 120_000 },
            clock.clone(),
        );
        let bootstrap = ProfileBootstrap { poll_attempts, poll_delay: Duration::from_millis(1) };
        (AuthService::new(Arc::new(backend), login, registration, bootstrap), clock)
    }

    fn invalid_credentials() -> AppError {
        AuthError::InvalidCredentials { remaining_attempts: None }.into()
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("  Shopper@Example.COM "), "shopper@example.com");
        assert_eq!(normalize_identifier("   "), "");
    }

    #[tokio::test]
    async fn test_login_success_resets_attempts() {
        let mut backend = MockAuthBackend::new();
        let mut calls = 0;
        backend
            .expect_sign_in()
            .withf(|email, _| email == "a@b.com")
            .times(2)
            .returning(move |email, _| {
                calls += 1;
                if calls == 1 { Err(invalid_credentials()) } else { Ok(session(email)) }
            });
        let (service, _) = service(backend, 1);

        let err = service.login(" A@B.com", "wrong").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::AuthError(AuthError::InvalidCredentials { remaining_attempts: Some(2) })
        ));

        service.login("a@b.com", "right").await.unwrap();
        assert_eq!(service.login_limiter().remaining_attempts("a@b.com"), 3);
    }

    #[tokio::test]
    async fn test_login_locks_out_after_max_failures() {
        let mut backend = MockAuthBackend::new();
        backend
            .expect_sign_in()
            .times(3)
            .returning(|_, _| Err(invalid_credentials()));
        let (service, clock) = service(backend, 1);

        for _ in 0..2 {
            let err = service.login("a@b.com", "wrong").await.unwrap_err();
            assert!(matches!(err, AppError::AuthError(AuthError::InvalidCredentials { .. })));
        }

        let err = service.login("a@b.com", "wrong").await.unwrap_err();
        match err {
            AppError::AuthError(AuthError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("Expected rate limit, got {:?}", other),
        }

        // Locked out: the provider is not contacted again (times(3) above).
        clock.advance(chrono::Duration::seconds(20));
        let err = service.login("a@b.com", "whatever").await.unwrap_err();
        match err {
            AppError::AuthError(AuthError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            other => panic!("Expected rate limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_outage_is_not_counted() {
        let mut backend = MockAuthBackend::new();
        backend.expect_sign_in().returning(|_, _| {
            Err(crate::error::BackendError::RequestFailed("connection refused".into()).into())
        });
        let (service, _) = service(backend, 1);

        for _ in 0..5 {
            let err = service.login("a@b.com", "pw").await.unwrap_err();
            assert!(matches!(err, AppError::BackendError(_)));
        }
        assert_eq!(service.login_limiter().remaining_attempts("a@b.com"), 3);
        // Each failed call gave its reserved slot back.
        assert_eq!(service.login_limiter().tracked_identifiers(), 0);
    }

    #[tokio::test]
    async fn test_empty_credentials_are_rejected_before_limiter() {
        let backend = MockAuthBackend::new();
        let (service, _) = service(backend, 1);

        let err = service.login("   ", "pw").await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        let err = service.register("a@b.com", "", None).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert_eq!(service.login_limiter().tracked_identifiers(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_is_refused() {
        let mut backend = MockAuthBackend::new();
        backend.expect_sign_in().returning(|email, _| {
            let mut s = session(email);
            s.expires_at = Utc::now() - chrono::Duration::seconds(5);
            Ok(s)
        });
        let (service, _) = service(backend, 1);

        let err = service.login("a@b.com", "pw").await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(AuthError::SessionExpired)));
    }

    #[tokio::test]
    async fn test_register_polls_until_profile_exists() {
        let mut backend = MockAuthBackend::new();
        backend.expect_sign_up().times(1).returning(|email, _, _| {
            let s = session(email);
            Ok(Registration { user: s.user.clone(), session: Some(s) })
        });
        let mut polls = 0;
        backend
            .expect_fetch_profile()
            .withf(|_, token| token.as_deref() == Some("access"))
            .times(3)
            .returning(move |id, _| {
                polls += 1;
                Ok((polls == 3).then(|| Profile { id, email: None, display_name: None }))
            });
        backend.expect_create_profile().never();
        let (service, _) = service(backend, 5);

        let registration = service.register("new@b.com", "pw", Some("New")).await.unwrap();
        assert!(!registration.confirmation_required());
    }

    #[tokio::test]
    async fn test_register_creates_missing_profile() {
        let mut backend = MockAuthBackend::new();
        let user = AuthUser { id: Uuid::new_v4(), email: Some("new@b.com".into()) };
        let expected_id = user.id;
        backend
            .expect_sign_up()
            .returning(move |_, _, _| Ok(Registration { user: user.clone(), session: None }));
        backend
            .expect_fetch_profile()
            .withf(|_, token| token.is_none())
            .times(2)
            .returning(|_, _| Ok(None));
        backend
            .expect_create_profile()
            .withf(move |profile, _| {
                profile.id == expected_id && profile.display_name.as_deref() == Some("New")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (service, _) = service(backend, 2);

        let registration = service.register("new@b.com", "pw", Some("  New ")).await.unwrap();
        assert!(registration.confirmation_required());
    }

    #[tokio::test]
    async fn test_register_rejections_lock_out() {
        let mut backend = MockAuthBackend::new();
        backend
            .expect_sign_up()
            .times(2)
            .returning(|_, _, _| Err(AuthError::RegistrationRejected("User already registered".into()).into()));
        let (service, _) = service(backend, 1);

        let err = service.register("dup@b.com", "pw", None).await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(AuthError::RegistrationRejected(_))));

        let err = service.register("dup@b.com", "pw", None).await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(AuthError::RateLimited { .. })));

        let err = service.register("dup@b.com", "pw", None).await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(AuthError::RateLimited { .. })));

        // Login attempts are tracked separately.
        assert!(!service.login_limiter().is_rate_limited("dup@b.com").limited);
    }

    #[tokio::test]
    async fn test_logout_requires_token() {
        let mut backend = MockAuthBackend::new();
        backend
            .expect_sign_out()
            .withf(|token| token == "access")
            .times(1)
            .returning(|_| Ok(()));
        let (service, _) = service(backend, 1);

        let err = service.logout(" ").await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(AuthError::InvalidToken)));
        service.logout("access").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_sweeps_both_limiters() {
        let mut backend = MockAuthBackend::new();
        backend.expect_sign_in().returning(|_, _| Err(invalid_credentials()));
        backend
            .expect_sign_up()
            .returning(|_, _, _| Err(AuthError::RegistrationRejected("weak password".into()).into()));
        let (service, clock) = service(backend, 1);

        let _ = service.login("a@b.com", "pw").await;
        let _ = service.register("c@d.com", "pw", None).await;
        assert_eq!(service.purge_expired(), 0);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(service.purge_expired(), 2);
    }
}
