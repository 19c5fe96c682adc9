use crate::metrics::PERSIST_DEGRADED;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{error, info};

/// Tracks consecutive dataset append failures.
///
/// Once `threshold` messages in a row could not be persisted the service is
/// reported as degraded until the next successful append.
#[derive(Debug)]
pub struct PersistenceHealth {
    threshold: u32,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub alarm_threshold: u32,
}

impl PersistenceHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if self.degraded.swap(false, Ordering::SeqCst) {
            PERSIST_DEGRADED.set(0.0);
            info!(
                "Dataset writes recovered after {} consecutive failed messages",
                failures
            );
        }
    }

    /// Returns true when this failure tripped the alarm.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold && !self.degraded.swap(true, Ordering::SeqCst) {
            PERSIST_DEGRADED.set(1.0);
            error!(
                "ALARM: {} consecutive messages could not be persisted; dataset writes are failing",
                failures
            );
            return true;
        }
        false
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: if self.is_degraded() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            alarm_threshold: self.threshold,
        }
    }
}
