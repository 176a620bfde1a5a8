//! Run statistics
//!
//! Attempted vs succeeded vs failed counts per stage, and the aggregate
//! summary surfaced at process exit. Partial failure is a normal outcome;
//! the summary is how it becomes visible.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-item outcome within a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    AlreadyExisted,
    Failed,
    /// Not attempted: prerequisite missing or run cancelled
    Skipped,
    /// Dropped candidate (e.g. a membership edge that would close a cycle);
    /// not an error
    Rejected,
}

/// Counters for one pipeline stage
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StageStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub already_existed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub rejected: u64,
}

impl StageStats {
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.attempted += 1;
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::AlreadyExisted => self.already_existed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Rejected => self.rejected += 1,
        }
    }

    pub fn merge(&mut self, other: StageStats) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.already_existed += other.already_existed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.rejected += other.rejected;
    }

    /// Successful writes, counting idempotent re-creates
    pub fn successes(&self) -> u64 {
        self.succeeded + self.already_existed
    }

    /// Failed plus never-attempted share of the stage; skips caused by a
    /// failed prerequisite count against the stage
    pub fn failure_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        (self.failed + self.skipped) as f64 / self.attempted as f64
    }
}

/// Aggregate result of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Object-creation stats keyed by stage: ous, groups, principals, gpos
    pub objects: BTreeMap<String, StageStats>,
    pub relationships: StageStats,
    pub misconfigurations: StageStats,
    /// Entries durably recorded in the answer-key ledger
    pub ledger_entries: usize,
}

impl RunSummary {
    pub fn objects_total(&self) -> StageStats {
        let mut total = StageStats::default();
        for stats in self.objects.values() {
            total.merge(*stats);
        }
        total
    }

    /// Whether the critical stage (OU creation) failed badly enough that
    /// the process should exit non-zero. A cancelled run skips its
    /// remaining work deliberately and never counts as a critical failure.
    pub fn critical_failure(&self, threshold: f64) -> bool {
        if self.cancelled {
            return false;
        }
        self.objects
            .get("ous")
            .map(|stats| stats.failure_rate() > threshold)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut a = StageStats::default();
        a.record(ItemOutcome::Succeeded);
        a.record(ItemOutcome::AlreadyExisted);
        a.record(ItemOutcome::Failed);
        let mut b = StageStats::default();
        b.record(ItemOutcome::Skipped);
        a.merge(b);
        assert_eq!(a.attempted, 4);
        assert_eq!(a.successes(), 2);
        assert_eq!(a.failed, 1);
        assert_eq!(a.skipped, 1);
    }

    #[test]
    fn test_failure_rate() {
        let mut stats = StageStats::default();
        assert_eq!(stats.failure_rate(), 0.0);
        for _ in 0..8 {
            stats.record(ItemOutcome::Succeeded);
        }
        stats.record(ItemOutcome::Failed);
        stats.record(ItemOutcome::Skipped);
        assert!((stats.failure_rate() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_critical_failure_threshold() {
        let mut objects = BTreeMap::new();
        let mut ous = StageStats::default();
        for _ in 0..9 {
            ous.record(ItemOutcome::Succeeded);
        }
        ous.record(ItemOutcome::Failed);
        objects.insert("ous".to_string(), ous);
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cancelled: false,
            objects,
            relationships: StageStats::default(),
            misconfigurations: StageStats::default(),
            ledger_entries: 0,
        };
        assert!(summary.critical_failure(0.05));
        assert!(!summary.critical_failure(0.2));
    }

    #[test]
    fn test_cancelled_run_is_not_a_critical_failure() {
        let mut objects = BTreeMap::new();
        let mut ous = StageStats::default();
        for _ in 0..10 {
            ous.record(ItemOutcome::Skipped);
        }
        objects.insert("ous".to_string(), ous);
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cancelled: true,
            objects,
            relationships: StageStats::default(),
            misconfigurations: StageStats::default(),
            ledger_entries: 0,
        };
        assert!(!summary.critical_failure(0.1));
    }
}
