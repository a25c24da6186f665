use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the coordination engine.
///
/// Everything has a sensible default; embedders override selectively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fraction of the rank group that must hold pending triggers before
    /// a lazily ganged module is executed.
    pub lazy_gang_threshold: f64,

    /// Shortest idle-loop sleep, in microseconds.
    pub idle_wait_min_us: u64,

    /// Longest idle-loop sleep, in microseconds. The wait doubles from the
    /// minimum while no traffic arrives and snaps back on activity.
    pub idle_wait_max_us: u64,

    /// How long a quit waits for modules to drain before giving up.
    pub shutdown_grace_ms: u64,

    /// Capacity of the lifecycle event bus.
    pub event_capacity: usize,

    /// Minimum spacing between transfer-status publications on rank 0.
    pub transfer_status_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lazy_gang_threshold: 0.2,
            idle_wait_min_us: 200,
            idle_wait_max_us: 10_000,
            shutdown_grace_ms: 3_000,
            event_capacity: 256,
            transfer_status_interval_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn idle_wait_min(&self) -> Duration {
        Duration::from_micros(self.idle_wait_min_us)
    }

    pub fn idle_wait_max(&self) -> Duration {
        Duration::from_micros(self.idle_wait_max_us)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn transfer_status_interval(&self) -> Duration {
        Duration::from_millis(self.transfer_status_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = EngineConfig::default();
        assert!(cfg.lazy_gang_threshold > 0.0 && cfg.lazy_gang_threshold < 1.0);
        assert!(cfg.idle_wait_min() < cfg.idle_wait_max());
        assert!(cfg.event_capacity > 0);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = EngineConfig { shutdown_grace_ms: 10, ..Default::default() };
        let text = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.shutdown_grace_ms, 10);
        assert_eq!(back.lazy_gang_threshold, cfg.lazy_gang_threshold);
    }
}
