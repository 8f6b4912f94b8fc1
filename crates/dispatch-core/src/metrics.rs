//! Global atomic counters for dispatch observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event, or [`Metrics::write_json`] to persist them to the metrics file.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    issues_registered: AtomicU64,
    agents_dispatched: AtomicU64,
    agents_completed: AtomicU64,
    agents_failed: AtomicU64,
    agent_retries: AtomicU64,
    persistence_failures: AtomicU64,
}

/// Point-in-time copy of the counters, as written to the metrics file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub issues_registered: u64,
    pub agents_dispatched: u64,
    pub agents_completed: u64,
    pub agents_failed: u64,
    pub agent_retries: u64,
    pub persistence_failures: u64,
    pub recorded_at: DateTime<Utc>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            issues_registered: AtomicU64::new(0),
            agents_dispatched: AtomicU64::new(0),
            agents_completed: AtomicU64::new(0),
            agents_failed: AtomicU64::new(0),
            agent_retries: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_issues_registered(&self) {
        self.issues_registered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "issues_registered", "counter incremented");
    }

    pub fn inc_agents_dispatched(&self) {
        self.agents_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agents_dispatched", "counter incremented");
    }

    pub fn inc_agents_completed(&self) {
        self.agents_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agents_completed", "counter incremented");
    }

    pub fn inc_agents_failed(&self) {
        self.agents_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agents_failed", "counter incremented");
    }

    pub fn inc_agent_retries(&self) {
        self.agent_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agent_retries", "counter incremented");
    }

    pub fn inc_persistence_failures(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persistence_failures", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            issues_registered: self.issues_registered.load(Ordering::Relaxed),
            agents_dispatched: self.agents_dispatched.load(Ordering::Relaxed),
            agents_completed: self.agents_completed.load(Ordering::Relaxed),
            agents_failed: self.agents_failed.load(Ordering::Relaxed),
            agent_retries: self.agent_retries.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            recorded_at: Utc::now(),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run) rather than on every
    /// increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            issues_registered = s.issues_registered,
            agents_dispatched = s.agents_dispatched,
            agents_completed = s.agents_completed,
            agents_failed = s.agents_failed,
            agent_retries = s.agent_retries,
            persistence_failures = s.persistence_failures,
        );
    }

    /// Write the current snapshot as pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec_pretty(&self.snapshot())?)?;
        Ok(())
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.issues_registered.store(0, Ordering::Relaxed);
        self.agents_dispatched.store(0, Ordering::Relaxed);
        self.agents_completed.store(0, Ordering::Relaxed);
        self.agents_failed.store(0, Ordering::Relaxed);
        self.agent_retries.store(0, Ordering::Relaxed);
        self.persistence_failures.store(0, Ordering::Relaxed);
    }
}
