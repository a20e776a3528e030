// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time-based liveness of verification attempts.
//!
//! A request is only actionable within a bounded window around its origin timestamp, and a
//! non-terminal attempt that outlives the window is cancelled with a timeout. All times are unix
//! milliseconds.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::identifiers::Timestamp;
use crate::state::VerificationState;

/// How long a verification attempt stays actionable after its request was created.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Tolerated forward clock skew of the requesting party.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// How often a live attempt checks whether it timed out.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Liveness parameters of an attempt. The defaults match the protocol; tests shrink them.
#[derive(Clone, Copy, Debug)]
pub struct LivenessConfig {
    pub active_window: Duration,
    pub clock_skew_tolerance: Duration,
    pub poll_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            active_window: ACTIVE_WINDOW,
            clock_skew_tolerance: CLOCK_SKEW_TOLERANCE,
            poll_interval: LIVENESS_POLL_INTERVAL,
        }
    }
}

/// Whether a request created at `created_at` is still actionable at `now`.
///
/// Requests from too far in the future (beyond the skew tolerance) or past the active window are
/// dead on arrival.
pub fn is_request_active(created_at: Timestamp, now: Timestamp, config: &LivenessConfig) -> bool {
    let skew = config.clock_skew_tolerance.as_millis() as u64;
    let window = config.active_window.as_millis() as u64;
    created_at <= now.saturating_add(skew) && now.saturating_sub(created_at) <= window
}

/// As [`is_request_active`], but an attempt that already reached a terminal state is not active
/// either.
pub fn is_attempt_active(
    created_at: Timestamp,
    now: Timestamp,
    state: &VerificationState,
    config: &LivenessConfig,
) -> bool {
    !state.is_terminal() && is_request_active(created_at, now, config)
}

/// Whether an attempt in `state` has run out the clock.
pub fn is_timed_out(
    created_at: Timestamp,
    now: Timestamp,
    state: &VerificationState,
    config: &LivenessConfig,
) -> bool {
    !state.is_terminal() && now.saturating_sub(created_at) > config.active_window.as_millis() as u64
}

/// Current unix time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60 * 1000;

    #[test]
    fn request_window() {
        let config = LivenessConfig::default();
        let now = 100 * MINUTE;

        assert!(is_request_active(now, now, &config));
        assert!(is_request_active(now - 10 * MINUTE, now, &config));
        assert!(!is_request_active(now - 10 * MINUTE - 1, now, &config));

        // Forward skew within tolerance is accepted.
        assert!(is_request_active(now + 5 * MINUTE, now, &config));
        assert!(!is_request_active(now + 5 * MINUTE + 1, now, &config));
    }

    #[test]
    fn terminal_attempts_are_not_active() {
        let config = LivenessConfig::default();
        let now = 100 * MINUTE;
        assert!(is_attempt_active(
            now,
            now,
            &VerificationState::OwnRequest,
            &config
        ));
        assert!(!is_attempt_active(
            now,
            now,
            &VerificationState::Done,
            &config
        ));
    }

    #[test]
    fn timeout_spares_terminal_attempts() {
        let config = LivenessConfig::default();
        let now = 100 * MINUTE;
        let stale = now - 11 * MINUTE;

        assert!(is_timed_out(
            stale,
            now,
            &VerificationState::OwnRequest,
            &config
        ));
        assert!(!is_timed_out(
            stale,
            now,
            &VerificationState::Done,
            &config
        ));
        assert!(!is_timed_out(
            now,
            now,
            &VerificationState::OwnRequest,
            &config
        ));
    }
}
