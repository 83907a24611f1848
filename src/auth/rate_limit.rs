use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use chrono::{DateTime, Utc, Duration};
use serde::Deserialize;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window_ms: u64,
    pub lockout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_ms: 15 * 60 * 1000,  // 15 minutes
            lockout_ms: 15 * 60 * 1000, // 15 minutes
        }
    }
}

impl RateLimitConfig {
    /// Limits applied to sign-up attempts: 3 per hour, one hour lockout.
    pub fn registration() -> Self {
        Self {
            max_attempts: 3,
            window_ms: 60 * 60 * 1000,
            lockout_ms: 60 * 60 * 1000,
        }
    }

    fn window(&self) -> Duration {
        millis(self.window_ms)
    }

    fn lockout(&self) -> Duration {
        millis(self.lockout_ms)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Outcome of [`RateLimiter::is_rate_limited`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limited: bool,
    pub remaining_time: Option<std::time::Duration>,
}

impl RateLimitStatus {
    fn allowed() -> Self {
        Self {
            limited: false,
            remaining_time: None,
        }
    }
}

/// Why [`RateLimiter::try_acquire`] turned an attempt away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDenied {
    LockedOut { remaining: std::time::Duration },
    /// Attempts already in flight would use up what is left of the budget.
    InFlight,
}

impl AttemptDenied {
    /// In-flight attempts settle within one provider round trip.
    const IN_FLIGHT_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

    pub fn retry_after(&self) -> std::time::Duration {
        match self {
            AttemptDenied::LockedOut { remaining } => *remaining,
            AttemptDenied::InFlight => Self::IN_FLIGHT_RETRY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Failed,
    Succeeded,
    Released,
}

#[derive(Debug, Default)]
struct AttemptRecord {
    attempts: VecDeque<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    in_flight: u32,
}

impl AttemptRecord {
    /// A lockout that has run out wipes the slate.
    fn lockout_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if now >= until)
    }

    fn active_lockout(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| now < *until)
    }

    fn attempts_in_window(&self, now: DateTime<Utc>, window: Duration) -> usize {
        if self.lockout_expired(now) {
            return 0;
        }
        // Inclusive at the boundary.
        self.attempts
            .iter()
            .filter(|ts| now.signed_duration_since(**ts) <= window)
            .count()
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.lockout_expired(now) {
            self.attempts.clear();
            self.locked_until = None;
            return;
        }
        self.attempts
            .retain(|ts| now.signed_duration_since(*ts) <= window);
    }

    fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.in_flight == 0
            && self.active_lockout(now).is_none()
            && self.attempts_in_window(now, window) == 0
    }

    fn is_empty(&self) -> bool {
        self.in_flight == 0 && self.attempts.is_empty() && self.locked_until.is_none()
    }

    fn clear(&mut self) {
        self.attempts.clear();
        self.locked_until = None;
    }

    fn register_failure(&mut self, identifier: &str, now: DateTime<Utc>, config: &RateLimitConfig) {
        // Attempts during an active lockout neither count nor extend it.
        if self.active_lockout(now).is_some() {
            debug!("Ignoring attempt for {} while locked out", identifier);
            return;
        }

        self.prune(now, config.window());
        self.attempts.push_back(now);

        if self.attempts.len() >= config.max_attempts as usize {
            let until = now
                .checked_add_signed(config.lockout())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.locked_until = Some(until);
            warn!(
                "Locking out {} after {} failed attempts until {}",
                identifier,
                self.attempts.len(),
                until.to_rfc3339()
            );
        }
    }
}

/// A reserved attempt slot. Counts against `max_attempts` until settled with
/// [`fail`](Self::fail) or [`succeed`](Self::succeed); dropping it unsettled
/// gives the slot back without counting a failure.
#[must_use = "an unsettled permit is released on drop"]
pub struct AttemptPermit<'a> {
    limiter: &'a RateLimiter,
    identifier: String,
    settled: bool,
}

impl AttemptPermit<'_> {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The attempt was rejected by the identity provider.
    pub fn fail(mut self) {
        self.settled = true;
        self.limiter.settle(&self.identifier, Settlement::Failed);
    }

    /// The attempt authenticated; clears everything recorded for the identifier.
    pub fn succeed(mut self) {
        self.settled = true;
        self.limiter.settle(&self.identifier, Settlement::Succeeded);
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.settle(&self.identifier, Settlement::Released);
        }
    }
}

/// Sliding-log limiter for failed authentication attempts, keyed by an opaque
/// identifier. Expiry is evaluated lazily on each call.
pub struct RateLimiter {
    records: Mutex<HashMap<String, AttemptRecord>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, AttemptRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_rate_limited(&self, identifier: &str) -> RateLimitStatus {
        let now = self.clock.now();
        let records = self.records();

        let Some(until) = records
            .get(identifier)
            .and_then(|record| record.active_lockout(now))
        else {
            return RateLimitStatus::allowed();
        };

        RateLimitStatus {
            limited: true,
            remaining_time: Some(until.signed_duration_since(now).to_std().unwrap_or_default()),
        }
    }

    pub fn record_attempt(&self, identifier: &str) {
        let now = self.clock.now();
        let mut records = self.records();
        records
            .entry(identifier.to_string())
            .or_default()
            .register_failure(identifier, now, &self.config);
    }

    /// Checks the identifier and reserves an attempt slot in one step, so
    /// attempts still waiting on the provider count against the limit.
    pub fn try_acquire(&self, identifier: &str) -> Result<AttemptPermit<'_>, AttemptDenied> {
        let now = self.clock.now();
        let mut records = self.records();
        let record = records.entry(identifier.to_string()).or_default();

        if let Some(until) = record.active_lockout(now) {
            return Err(AttemptDenied::LockedOut {
                remaining: until.signed_duration_since(now).to_std().unwrap_or_default(),
            });
        }

        record.prune(now, self.config.window());
        let used = record.attempts.len() as u64 + u64::from(record.in_flight);
        if used >= u64::from(self.config.max_attempts) {
            if record.is_empty() {
                records.remove(identifier);
            }
            debug!("Denying attempt for {}: {} already counted or in flight", identifier, used);
            return Err(AttemptDenied::InFlight);
        }

        record.in_flight += 1;
        Ok(AttemptPermit {
            limiter: self,
            identifier: identifier.to_string(),
            settled: false,
        })
    }

    fn settle(&self, identifier: &str, settlement: Settlement) {
        let now = self.clock.now();
        let mut records = self.records();
        let Some(record) = records.get_mut(identifier) else {
            return;
        };

        record.in_flight = record.in_flight.saturating_sub(1);
        match settlement {
            Settlement::Failed => record.register_failure(identifier, now, &self.config),
            Settlement::Succeeded => record.clear(),
            Settlement::Released => {}
        }

        if record.is_empty() {
            records.remove(identifier);
        }
    }

    pub fn remaining_attempts(&self, identifier: &str) -> u32 {
        let now = self.clock.now();
        let used = self
            .records()
            .get(identifier)
            .map(|record| record.attempts_in_window(now, self.config.window()))
            .unwrap_or(0);

        let used = u32::try_from(used).unwrap_or(u32::MAX);
        self.config.max_attempts.saturating_sub(used)
    }

    /// Forgets every failure and lockout for the identifier. Slots reserved by
    /// attempts still in flight stay reserved until those settle.
    pub fn reset(&self, identifier: &str) {
        let mut records = self.records();
        if let Some(record) = records.get_mut(identifier) {
            record.clear();
            if record.is_empty() {
                records.remove(identifier);
            }
        }
    }

    /// Drops records with nothing left to enforce. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.window();
        let mut records = self.records();

        let before = records.len();
        records.retain(|_, record| !record.is_stale(now, window));
        before - records.len()
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.records().len()
    }
}
