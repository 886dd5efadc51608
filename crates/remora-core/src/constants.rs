//! Centralized constants for remora.
//!
//! Tiger Style: every timeout, period and capacity has an explicit default
//! and bound so no resource can grow or wait without limit.

// ============================================================================
// Invocation
// ============================================================================

/// Default per-invocation timeout (60 seconds).
pub const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 60_000;

/// Default transport connect timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default maximum number of pooled physical connections per client invoker.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 50;

/// Upper bound for `maxPoolSize`.
///
/// Tiger Style: Bounded to prevent connection exhaustion.
pub const MAX_POOL_SIZE_LIMIT: u32 = 1_024;

/// Default wait for a pooled connection when the pool is exhausted (30 seconds).
pub const DEFAULT_POOL_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Default delay before a released client invoker is destroyed (immediate).
pub const DEFAULT_INVOKER_DESTRUCTION_DELAY_MS: u64 = 0;

// ============================================================================
// Leasing
// ============================================================================

/// Default server lease period advertised to clients (5 seconds).
pub const DEFAULT_LEASE_PERIOD_MS: u64 = 5_000;

/// Default timeout for a single lease ping round trip (2 seconds).
///
/// Kept short and independent from the invocation timeout.
pub const DEFAULT_LEASE_PING_TIMEOUT_MS: u64 = 2_000;

/// Initial lease window as a multiple of the lease period.
pub const LEASE_WINDOW_MULTIPLIER: u64 = 2;

/// Largest lease window as a multiple of the lease period.
///
/// Tiger Style: late updates widen the window, but never without limit.
pub const MAX_LEASE_WINDOW_MULTIPLIER: u64 = 4;

/// The lease expiry check runs this many times per lease period.
pub const LEASE_CHECKS_PER_PERIOD: u64 = 4;

/// Smallest interval between lease expiry checks.
pub const MIN_LEASE_CHECK_INTERVAL_MS: u64 = 10;

/// Smallest accepted lease or ping period.
pub const MIN_LEASE_PERIOD_MS: u64 = 10;

/// Consecutive failed pings after which registered clients are told the
/// connection looks lost.
pub const PING_FAILURE_THRESHOLD: u32 = 3;

// ============================================================================
// Callbacks
// ============================================================================

/// Subsystem under which a client's callback dispatcher is mounted on a
/// callback connector.
pub const CALLBACK_SUBSYSTEM: &str = "$callback$";

/// Default pull-mode poll period (5 seconds).
pub const DEFAULT_CALLBACK_POLL_PERIOD_MS: u64 = 5_000;

/// Default number of queued pull-mode callbacks kept per handler.
pub const DEFAULT_CALLBACK_STORE_MAX: u32 = 1_000;

/// Upper bound for `callbackStoreMax`.
///
/// Tiger Style: Bounded to prevent memory exhaustion from an absent poller.
pub const MAX_CALLBACK_STORE_LIMIT: u32 = 100_000;

/// Session id used for requests issued by an invoker itself (pings).
pub const INVOKER_SESSION_ID: &str = "$invoker$";
