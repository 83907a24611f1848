use std::time::Duration;

/// Renders a lockout wait for end users, e.g. "2 minutes" or "45 seconds".
///
/// Minutes are used once the wait reaches 60 seconds. Both units round up so a
/// user is never told to retry before the lockout has actually lifted.
pub fn format_remaining_time(remaining: Duration) -> String {
    let millis = remaining.as_millis();
    let seconds = millis.div_ceil(1000);

    if seconds >= 60 {
        let minutes = millis.div_ceil(60_000);
        plural(minutes, "minute")
    } else {
        plural(seconds, "second")
    }
}

fn plural(count: u128, unit: &str) -> String {
    if count == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", count, unit)
    }
}
