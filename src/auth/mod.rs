//! Authentication module for the storefront auth gateway
//!
//! Throttles login and registration attempts per identifier and forwards
//! the ones that pass to the identity provider.

pub mod clock;
mod format;
pub mod handlers;
mod rate_limit;
mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use format::format_remaining_time;
pub use rate_limit::{AttemptDenied, AttemptPermit, RateLimiter, RateLimitConfig, RateLimitStatus};
pub use service::{normalize_identifier, AuthService, ProfileBootstrap};
