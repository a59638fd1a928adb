//! Simulation metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Feed counters, shared by every session.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    sessions: AtomicU64,
    auth_failures: AtomicU64,
    ticks_sent: AtomicU64,
    rejected_commands: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_sent(&self) {
        self.ticks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.rejected_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            ticks_sent: self.ticks_sent.load(Ordering::Relaxed),
            rejected_commands: self.rejected_commands.load(Ordering::Relaxed),
        }
    }
}

/// Counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub sessions: u64,
    pub auth_failures: u64,
    pub ticks_sent: u64,
    pub rejected_commands: u64,
}
