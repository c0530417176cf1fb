//! Deterministic time utilities.
//!
//! Lease deadlines are evaluated against `Tick` values that are carried
//! inside replicated commands. Wall clock is sampled only on the propose
//! path (grant, renew, the lease ticker); the apply engine never reads a
//! clock, so every replica evaluates the same deadlines.

use serde::{Deserialize, Serialize};

/// A millisecond timestamp carried in replicated commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the Unix epoch.
    pub ms: u64,
}

impl Tick {
    /// Create a new tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Create a tick representing zero (epoch start).
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Sample the wall clock. Propose path only; never called during apply.
    pub fn from_wall_clock() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self { ms: now }
    }

    /// Add milliseconds to this tick.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    /// Add whole seconds to this tick.
    pub const fn add_secs(self, secs: u64) -> Self {
        self.add_ms(secs.saturating_mul(1000))
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline.
    ///
    /// Returns 0 if the deadline has already passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}
