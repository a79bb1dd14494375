/// Share Ledger - per-session share counts for operator reporting
///
/// Not a source of truth: nothing here is persisted and nothing in the
/// protocol path reads it back. Sessions register when their connection
/// is accepted and are dropped when it closes; the process-wide totals
/// outlive them.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub worker: Option<String>,
    pub accepted: u64,
    pub rejected: u64,
    /// Unix seconds of the last submission, accepted or not
    pub last_share: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSnapshot {
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub sessions: HashMap<String, SessionStats>,
}

#[derive(Default)]
pub struct ShareLedger {
    sessions: RwLock<HashMap<String, SessionStats>>,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
}

impl ShareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str) {
        self.sessions.write().entry(session_id.to_string()).or_default();
    }

    pub fn set_worker(&self, session_id: &str, worker: &str) {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .worker = Some(worker.to_string());
    }

    /// Record one submission outcome. Returns the session's accepted count.
    pub fn record(&self, session_id: &str, accepted: bool) -> u64 {
        if accepted {
            self.total_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
        }

        let mut sessions = self.sessions.write();
        let stats = sessions.entry(session_id.to_string()).or_default();
        if accepted {
            stats.accepted += 1;
        } else {
            stats.rejected += 1;
        }
        stats.last_share = Some(chrono::Utc::now().timestamp());
        stats.accepted
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionStats> {
        self.sessions.write().remove(session_id)
    }

    pub fn session(&self, session_id: &str) -> Option<SessionStats> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_accepted: self.total_accepted(),
            total_rejected: self.total_rejected(),
            sessions: self.sessions.read().clone(),
        }
    }
}
