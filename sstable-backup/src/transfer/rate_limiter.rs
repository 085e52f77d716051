// Byte-rate limiting for transfer batches.
//
// Design:
// - Reservation model: a caller reserves N permits and sleeps until its
//   reservation starts, so one large chunk never starves behind small ones
// - Up to one second of unused permits is banked as burst capacity
// - One limiter per batch; nothing is shared across concurrent batches

use crate::utils::{BackupError, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Lowest byte rate any limit is allowed to fall to.
pub const MIN_TRANSFER_RATE: u64 = 500 * 1024;

/// Maximum banked burst.
const MAX_BURST: Duration = Duration::from_secs(1);

/// Permit-per-second rate limiter
///
/// `acquire(n)` never fails; it only delays. An unlimited limiter returns
/// immediately.
pub struct RateLimiter {
    /// Permits per second, `None` when unlimited
    rate: Option<f64>,

    /// Instant at which the next reservation may start
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(permits_per_second: u64) -> Self {
        Self {
            rate: Some(permits_per_second.max(1) as f64),
            next_free: Mutex::new(Instant::now()),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            rate: None,
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Limiter for an optional rate.
    pub fn from_rate(permits_per_second: Option<u64>) -> Self {
        permits_per_second.map_or_else(Self::unlimited, Self::new)
    }

    /// Wait until `permits` can be consumed.
    pub async fn acquire(&self, permits: u64) {
        let wait = self.reserve(permits);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Reserve `permits` and return how long the caller must wait.
    fn reserve(&self, permits: u64) -> Duration {
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };
        let cost = Duration::from_secs_f64(permits as f64 / rate);

        let now = Instant::now();
        let mut next_free = self.next_free.lock().unwrap_or_else(|e| e.into_inner());
        let earliest = now.checked_sub(MAX_BURST).unwrap_or(now);
        let start = (*next_free).max(earliest);
        *next_free = start + cost;

        start.saturating_duration_since(now)
    }
}

/// Byte rate for a batch of `total_bytes`.
///
/// A target duration yields `total_bytes / duration`; an explicit cap
/// lowers that, and the result never drops below `MIN_TRANSFER_RATE`.
/// `None` means unlimited.
pub fn effective_rate(
    total_bytes: u64,
    duration: Option<Duration>,
    explicit_cap: Option<u64>,
) -> Option<u64> {
    let derived = duration
        .filter(|d| !d.is_zero())
        .map(|d| (total_bytes as f64 / d.as_secs_f64()) as u64);

    let limit = match (derived, explicit_cap) {
        (Some(derived), Some(cap)) => derived.min(cap),
        (Some(rate), None) | (None, Some(rate)) => rate,
        (None, None) => return None,
    };
    Some(limit.max(MIN_TRANSFER_RATE))
}

/// Parse a bandwidth such as `500KB`, `10MB` or `1048576` into bytes per second.
pub fn parse_bandwidth(value: &str) -> Result<u64> {
    let trimmed = value.trim().trim_end_matches("/s");
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = [("GB", 1u64 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)]
        .into_iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|d| (d.trim(), mult)))
        .unwrap_or((upper.as_str(), 1));

    let amount: u64 = digits
        .parse()
        .map_err(|_| BackupError::Config(format!("invalid bandwidth '{value}'")))?;
    if amount == 0 {
        return Err(BackupError::Config(format!("bandwidth '{value}' must be positive")));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| BackupError::Config(format!("bandwidth '{value}' is too large")))
}
