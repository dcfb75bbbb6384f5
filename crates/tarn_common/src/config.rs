//! Locking section of the engine configuration (`[locking]` in tarn.toml).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the lock subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Admission tickets for shared-family global locks (IS/S).
    #[serde(default = "default_tickets")]
    pub read_tickets: u32,
    /// Admission tickets for intent-exclusive global locks (IX). Exclusive
    /// global locks bypass ticketing.
    #[serde(default = "default_tickets")]
    pub write_tickets: u32,
    /// How often a blocked request wakes to re-check its deadline and run
    /// deadlock detection, in milliseconds.
    #[serde(default = "default_deadlock_poll_ms")]
    pub deadlock_poll_ms: u64,
    /// Upper bound applied to every lock wait regardless of the caller's
    /// deadline (0 = unlimited). Uninterruptible sessions are exempt.
    #[serde(default)]
    pub max_lock_timeout_ms: u64,
    /// Interval between background sweeps of empty per-resource lock state,
    /// in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_tickets() -> u32 {
    128
}

fn default_deadlock_poll_ms() -> u64 {
    500
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            read_tickets: default_tickets(),
            write_tickets: default_tickets(),
            deadlock_poll_ms: default_deadlock_poll_ms(),
            max_lock_timeout_ms: 0,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl LockConfig {
    pub fn deadlock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_poll_ms)
    }

    pub fn max_lock_timeout(&self) -> Option<Duration> {
        if self.max_lock_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.max_lock_timeout_ms))
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LockConfig::default();
        assert_eq!(cfg.read_tickets, 128);
        assert_eq!(cfg.write_tickets, 128);
        assert_eq!(cfg.deadlock_poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.max_lock_timeout(), None);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: LockConfig = serde_json::from_str(r#"{"write_tickets": 4}"#).unwrap();
        assert_eq!(cfg.write_tickets, 4);
        assert_eq!(cfg.read_tickets, 128);
        assert_eq!(cfg.deadlock_poll_ms, 500);
    }
}
