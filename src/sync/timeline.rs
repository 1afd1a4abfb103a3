//! Timeline maths shared by every client
//!
//! A screen's anchor `(start_epoch_ms, base_pos_ms)` places it on the
//! timeline relative to server time. Clients estimate server time from the
//! last broadcast plus their own monotonic clock.

use crate::utils::monotonic_ns;

/// Anchor changes smaller than this are treated as timer jitter
pub const JUMP_THRESHOLD_MS: i64 = 250;

/// Position a screen should be showing at server time `server_now_ms`
///
/// Without a usable anchor (either time unknown) the base position is
/// returned. The upper clamp to `duration_ms` applies only to known,
/// non-looping durations.
pub fn position_ms(
    base_pos_ms: i64,
    start_epoch_ms: i64,
    server_now_ms: i64,
    duration_ms: i64,
    looping: bool,
) -> i64 {
    let base = base_pos_ms.max(0);
    if server_now_ms <= 0 || start_epoch_ms <= 0 {
        return base;
    }

    let pos = base.saturating_add((server_now_ms - start_epoch_ms).max(0));
    if duration_ms > 0 && !looping {
        pos.min(duration_ms)
    } else {
        pos
    }
}

/// Whether moving from one computed position to another is a real seek
pub fn is_jump(previous_ms: i64, next_ms: i64) -> bool {
    (next_ms - previous_ms).abs() >= JUMP_THRESHOLD_MS
}

/// Local estimate of the server clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerClock {
    server_now_ms: i64,
    received_local_ms: i64,
}

impl ServerClock {
    /// Local monotonic milliseconds, never 0
    pub fn local_now_ms() -> i64 {
        (monotonic_ns() / 1_000_000) as i64 + 1
    }

    /// Record a broadcast received at local time `local_ms`
    ///
    /// A zero `server_now_ms` (older protocol) clears the anchor.
    pub fn on_sync(&mut self, server_now_ms: i64, local_ms: i64) {
        if server_now_ms > 0 {
            self.server_now_ms = server_now_ms;
            self.received_local_ms = local_ms;
        } else {
            *self = Self::default();
        }
    }

    /// Estimated server time at local time `local_ms`, 0 when unknown
    pub fn estimate(&self, local_ms: i64) -> i64 {
        if self.server_now_ms <= 0 || self.received_local_ms <= 0 {
            return 0;
        }
        self.server_now_ms + (local_ms - self.received_local_ms).max(0)
    }

    pub fn now(&self) -> i64 {
        self.estimate(Self::local_now_ms())
    }

    /// Local time the last anchored broadcast arrived, 0 when unknown
    pub fn received_local_ms(&self) -> i64 {
        self.received_local_ms
    }
}
