//! Process-wide tunables shared by every session.
//!
//! These are the only values that can change while sessions are running.
//! One [`Tunables`] is created from configuration at startup and handed to
//! every session through its [`SessionEnv`](crate::env::SessionEnv).

use std::sync::atomic::{AtomicU64, Ordering};

use osql_config::LimitsConfig;

/// Runtime-adjustable limits.
#[derive(Debug)]
pub struct Tunables {
    max_transfer: AtomicU64,
    max_throttle_seconds: AtomicU64,
}

impl Tunables {
    pub fn new(max_transfer: u64, max_throttle_seconds: u64) -> Self {
        Self {
            max_transfer: AtomicU64::new(max_transfer),
            max_throttle_seconds: AtomicU64::new(max_throttle_seconds),
        }
    }

    pub fn from_config(limits: &LimitsConfig) -> Self {
        Self::new(limits.max_transaction_ops, limits.max_throttle_seconds)
    }

    /// Sets the default maximum operations per transaction (0 = unlimited).
    pub fn set_max_transfer(&self, limit: u64) {
        self.max_transfer.store(limit, Ordering::Relaxed);
        tracing::info!(limit, "max transfer updated");
    }

    pub fn get_max_transfer(&self) -> u64 {
        self.max_transfer.load(Ordering::Relaxed)
    }

    /// Sets the throttling ceiling for offload requests.
    pub fn set_max_throttle_seconds(&self, limit: u64) {
        self.max_throttle_seconds.store(limit, Ordering::Relaxed);
        tracing::info!(limit, "max throttle seconds updated");
    }

    pub fn get_max_throttle_seconds(&self) -> u64 {
        self.max_throttle_seconds.load(Ordering::Relaxed)
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::from_config(&LimitsConfig::default())
    }
}
