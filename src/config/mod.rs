use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::Deserialize;
use std::env;

use crate::auth::RateLimitConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub profile_poll_attempts: u32,
    pub profile_poll_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub login: RateLimitConfig,
    pub registration: RateLimitConfig,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub supabase: SupabaseConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitSettings,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    environment: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let login = RateLimitConfig::default();
    let registration = RateLimitConfig::registration();

    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("cors.enabled", true)?
        .set_default("cors.allow_any_origin", false)?
        .set_default("cors.max_age", 3600)?
        .set_default("supabase.url", "http://localhost:54321")?
        .set_default("supabase.anon_key", "")?
        .set_default("supabase.request_timeout_secs", 10)?
        .set_default("auth.profile_poll_attempts", 5)?
        .set_default("auth.profile_poll_delay_ms", 500)?
        .set_default("rate_limit.login.max_attempts", login.max_attempts as i64)?
        .set_default("rate_limit.login.window_ms", login.window_ms as i64)?
        .set_default("rate_limit.login.lockout_ms", login.lockout_ms as i64)?
        .set_default("rate_limit.registration.max_attempts", registration.max_attempts as i64)?
        .set_default("rate_limit.registration.window_ms", registration.window_ms as i64)?
        .set_default("rate_limit.registration.lockout_ms", registration.lockout_ms as i64)?
        .set_default("rate_limit.sweep_interval_secs", 60)
}

fn env_source() -> Environment {
    // E.g. `APP_RATE_LIMIT__LOGIN__MAX_ATTEMPTS=10` sets `rate_limit.login.max_attempts`
    Environment::with_prefix("app")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        with_defaults(Config::builder(), "development")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(env_source())
            .build()?
            .try_deserialize()
    }

    /// Defaults only, with fast profile polling. No files, no environment.
    pub fn new_for_test() -> Result<Self, ConfigError> {
        with_defaults(Config::builder(), "test")?
            .set_override("supabase.anon_key", "test-anon-key")?
            .set_override("auth.profile_poll_delay_ms", 1)?
            .build()?
            .try_deserialize()
    }
}
