//! UTC boundary clock.
//!
//! A finality window is an integer index `w = floor(now_utc / interval)`;
//! its closing boundary is the instant `(w + 1) * interval`. UTC is read
//! from the local OS clock; no external time authority is consulted, only
//! the ±tolerance admissibility rule below. A monotonic clock (`Instant`)
//! is used separately for rate limiting and deadlines.

use std::time::{SystemTime, UNIX_EPOCH};

use super::TemporalError;
use crate::constants;

/// A UTC timestamp with sub-second precision, as carried by blocks and
/// heartbeats on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct UtcInstant {
    pub secs: i64,
    pub nanos: u32,
}

impl UtcInstant {
    pub fn new(secs: i64, nanos: u32) -> Self {
        UtcInstant { secs, nanos }
    }

    /// Read the current UTC time from the OS clock.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => UtcInstant {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            // Clock before the epoch: treat as the epoch itself.
            Err(_) => UtcInstant { secs: 0, nanos: 0 },
        }
    }

    /// Total nanoseconds since the UNIX epoch, for exact skew arithmetic.
    fn total_nanos(&self) -> i128 {
        self.secs as i128 * 1_000_000_000 + self.nanos as i128
    }
}

/// Translates between wall-clock UTC and finality-window indices, and
/// enforces the clock-skew admissibility rule.
#[derive(Clone, Debug)]
pub struct BoundaryClock {
    interval_secs: u64,
    tolerance_secs: u64,
}

impl BoundaryClock {
    pub fn new(interval_secs: u64, tolerance_secs: u64) -> Self {
        BoundaryClock {
            interval_secs,
            tolerance_secs,
        }
    }

    /// The production clock: 60-second windows, ±5 s tolerance.
    pub fn protocol_default() -> Self {
        BoundaryClock::new(
            constants::FINALITY_INTERVAL_SECS,
            constants::CLOCK_TOLERANCE_SECS,
        )
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    /// The current finality-window index.
    pub fn current_window(&self) -> u64 {
        self.window_of(UtcInstant::now())
    }

    /// The window containing a given instant. Pre-epoch instants map to
    /// window zero.
    pub fn window_of(&self, at: UtcInstant) -> u64 {
        if at.secs <= 0 {
            return 0;
        }
        at.secs as u64 / self.interval_secs
    }

    /// The opening instant of window `w` (which is also the closing
    /// boundary of window `w - 1`).
    pub fn boundary_of(&self, window: u64) -> UtcInstant {
        UtcInstant {
            secs: (window * self.interval_secs) as i64,
            nanos: 0,
        }
    }

    /// Seconds until the current window closes.
    pub fn seconds_to_next_boundary(&self) -> f64 {
        self.seconds_to_next_boundary_at(UtcInstant::now())
    }

    fn seconds_to_next_boundary_at(&self, now: UtcInstant) -> f64 {
        let next = (self.window_of(now) + 1) * self.interval_secs;
        let now_f = now.secs as f64 + now.nanos as f64 * 1e-9;
        (next as f64 - now_f).max(0.0)
    }

    /// Admissibility of an inbound timestamp against the local clock.
    ///
    /// A timestamp off by exactly the tolerance is accepted; one more
    /// nanosecond is rejected.
    pub fn check_timestamp(&self, ts: UtcInstant) -> Result<(), TemporalError> {
        self.check_timestamp_at(UtcInstant::now(), ts)
    }

    /// Same check against an explicit "now", for deterministic tests.
    pub fn check_timestamp_at(&self, now: UtcInstant, ts: UtcInstant) -> Result<(), TemporalError> {
        let skew = (ts.total_nanos() - now.total_nanos()).unsigned_abs();
        let tolerance = self.tolerance_secs as u128 * 1_000_000_000;
        if skew > tolerance {
            return Err(TemporalError::ClockSkew);
        }
        Ok(())
    }

    /// A proof for window `w` is acceptable while `w` has not advanced past
    /// the current window, and its carrier arrived before the close of
    /// window `w + 1`.
    pub fn check_window(&self, declared: u64, current: u64) -> Result<(), TemporalError> {
        if declared > current || current > declared + 1 {
            return Err(TemporalError::WindowMismatch { declared, current });
        }
        Ok(())
    }
}
