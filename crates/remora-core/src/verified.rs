//! Pure lease, ping and timeout computation functions.
//!
//! All functions are deterministic and side-effect free.
//!
//! # Tiger Style
//!
//! - Uses saturating arithmetic for all calculations
//! - Time is passed explicitly (no calls to a clock)
//! - Deterministic behavior for testing

use crate::constants::LEASE_CHECKS_PER_PERIOD;
use crate::constants::LEASE_WINDOW_MULTIPLIER;
use crate::constants::MAX_LEASE_WINDOW_MULTIPLIER;
use crate::constants::MIN_LEASE_CHECK_INTERVAL_MS;
use crate::constants::PING_FAILURE_THRESHOLD;

/// Window of a freshly started lease.
///
/// # Tiger Style
///
/// - Uses saturating_mul to prevent overflow
#[inline]
pub fn compute_initial_lease_window(period_ms: u64) -> u64 {
    period_ms.saturating_mul(LEASE_WINDOW_MULTIPLIER)
}

/// Window after a lease update.
///
/// - A changed period resets the window to the initial window of the new period.
/// - An update whose gap exceeded the current window widens it to
///   `gap + period`, capped at `MAX_LEASE_WINDOW_MULTIPLIER * period`.
/// - Otherwise the window holds.
///
/// The window never shrinks for an unchanged period.
///
/// # Arguments
///
/// * `current_window_ms` - Window in force before the update
/// * `old_period_ms` - Period in force before the update
/// * `new_period_ms` - Period carried by the update
/// * `gap_ms` - Time since the previous update
#[inline]
pub fn compute_updated_lease_window(current_window_ms: u64, old_period_ms: u64, new_period_ms: u64, gap_ms: u64) -> u64 {
    if new_period_ms != old_period_ms {
        return compute_initial_lease_window(new_period_ms);
    }
    if gap_ms <= current_window_ms {
        return current_window_ms;
    }
    let cap = new_period_ms.saturating_mul(MAX_LEASE_WINDOW_MULTIPLIER);
    gap_ms.saturating_add(new_period_ms).min(cap).max(current_window_ms)
}

/// A lease expires once the time since its last update exceeds the window.
#[inline]
pub fn is_lease_expired(elapsed_ms: u64, window_ms: u64) -> bool {
    elapsed_ms > window_ms
}

/// Interval between expiry checks of a lease with the given period.
#[inline]
pub fn compute_lease_check_interval(period_ms: u64) -> u64 {
    (period_ms / LEASE_CHECKS_PER_PERIOD).max(MIN_LEASE_CHECK_INTERVAL_MS)
}

/// Effective ping interval of a pinger: the minimum registered period.
///
/// Returns `None` when no client is registered.
#[inline]
pub fn compute_ping_interval(periods_ms: impl IntoIterator<Item = u64>) -> Option<u64> {
    periods_ms.into_iter().min()
}

/// Whether adding a client with `new_period_ms` must replace the ping task.
///
/// Only a strictly shorter period than the current interval perturbs the
/// schedule.
#[inline]
pub fn should_reschedule_on_add(current_interval_ms: Option<u64>, new_period_ms: u64) -> bool {
    match current_interval_ms {
        Some(current) => new_period_ms < current,
        None => true,
    }
}

/// Callback timeout by precedence: metadata, locator parameter, configuration
/// map `callbackTimeout`, configuration map `timeout`.
///
/// Returns `None` when none is set; callers then fall back to the normal
/// invocation timeout.
#[inline]
pub fn resolve_callback_timeout(
    metadata_ms: Option<u64>,
    locator_ms: Option<u64>,
    config_callback_ms: Option<u64>,
    config_timeout_ms: Option<u64>,
) -> Option<u64> {
    metadata_ms.or(locator_ms).or(config_callback_ms).or(config_timeout_ms)
}

/// True exactly when the consecutive failure count reaches the threshold,
/// so an outage is reported once.
#[inline]
pub fn should_report_ping_failure(consecutive_failures: u32) -> bool {
    consecutive_failures == PING_FAILURE_THRESHOLD
}
