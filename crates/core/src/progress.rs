use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferProgress {
    pub phase: String,
    pub link: Option<String>,
    pub current_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    pub queue_position: Option<usize>,
    pub processed: Option<u32>,
    pub requested: Option<u32>,
    pub note: Option<String>,
}

impl TransferProgress {
    pub fn phase(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..Self::default()
        }
    }

    pub fn bytes(phase: &str, current: u64, total: Option<u64>) -> Self {
        let percent = total
            .filter(|t| *t > 0)
            .map(|t| (current as f64 / t as f64) * 100.0);
        Self {
            phase: phase.to_string(),
            current_bytes: current,
            total_bytes: total,
            percent,
            ..Self::default()
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TransferProgress);
}

/// No-op sink for callers that do not render progress.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _progress: TransferProgress) {}
}

/// Rate gate for UI updates: edits faster than the platform tolerates get
/// dropped, completion updates always pass.
pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().expect("throttle mutex poisoned");
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Always passes; resets the gate so the next periodic update waits a
    /// full interval again.
    pub fn force(&self) {
        let mut last = self.last.lock().expect("throttle mutex poisoned");
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_gates_rapid_updates() {
        let t = Throttle::new(Duration::from_secs(60));
        assert!(t.ready());
        assert!(!t.ready());
        assert!(!t.ready());
    }

    #[test]
    fn throttle_zero_interval_always_ready() {
        let t = Throttle::new(Duration::ZERO);
        assert!(t.ready());
        assert!(t.ready());
    }

    #[test]
    fn percent_is_derived_from_totals() {
        let p = TransferProgress::bytes("downloading", 50, Some(200));
        assert_eq!(p.percent, Some(25.0));
        let p = TransferProgress::bytes("downloading", 50, None);
        assert_eq!(p.percent, None);
    }
}
