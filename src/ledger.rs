//! Answer-key ledger
//!
//! Append-only SQLite store for seeded misconfigurations. Every entry is
//! flushed the moment the corresponding change is confirmed against the
//! directory, carries a SHA-256 row checksum and exports to a stable JSON
//! document for graders.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{ForgeError, Result};
use crate::rules::RuleSeverity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub rule_id: String,
    pub severity: String,
    pub target_dn: String,
    pub timestamp: DateTime<Utc>,
    pub delta: BTreeMap<String, String>,
    pub remediation: String,
}

impl LedgerEntry {
    fn checksum(&self, run_id: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_bytes());
        hasher.update(self.rule_id.as_bytes());
        hasher.update(self.target_dn.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(serde_json::to_vec(&self.delta)?);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Durable record of every seeded weakness for a run
pub struct AnswerKeyLedger {
    db: Mutex<Connection>,
    run_id: String,
}

impl AnswerKeyLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path)?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS answer_key (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                target_dn TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                delta TEXT NOT NULL,
                remediation TEXT NOT NULL,
                checksum TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_answer_key_rule
                ON answer_key (rule_id, target_dn);
            CREATE INDEX IF NOT EXISTS idx_answer_key_run
                ON answer_key (run_id);",
        )?;
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, path = %path.display(), "answer-key ledger opened");
        Ok(Self {
            db: Mutex::new(db),
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one confirmed misconfiguration. The row is written and
    /// committed before this returns; a write failure is fatal to the run.
    pub fn record(
        &self,
        rule_id: &str,
        severity: RuleSeverity,
        target_dn: &str,
        delta: BTreeMap<String, String>,
        remediation: &str,
    ) -> Result<()> {
        let entry = LedgerEntry {
            rule_id: rule_id.to_string(),
            severity: severity.as_str().to_string(),
            target_dn: target_dn.to_string(),
            timestamp: Utc::now(),
            delta,
            remediation: remediation.to_string(),
        };
        let checksum = entry.checksum(&self.run_id)?;
        let delta_json = serde_json::to_string(&entry.delta)?;
        let db = self
            .db
            .lock()
            .map_err(|_| ForgeError::Ledger("ledger mutex poisoned".to_string()))?;
        db.execute(
            "INSERT INTO answer_key
                (run_id, rule_id, severity, target_dn, timestamp, delta, remediation, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.run_id,
                entry.rule_id,
                entry.severity,
                entry.target_dn,
                entry.timestamp.to_rfc3339(),
                delta_json,
                entry.remediation,
                checksum,
            ],
        )?;
        Ok(())
    }

    /// Whether a prior run already seeded `rule_id` on `target_dn`
    pub fn already_applied(&self, rule_id: &str, target_dn: &str) -> Result<bool> {
        let db = self
            .db
            .lock()
            .map_err(|_| ForgeError::Ledger("ledger mutex poisoned".to_string()))?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM answer_key WHERE rule_id = ?1 AND target_dn = ?2",
            params![rule_id, target_dn],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All entries across runs, oldest first
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let db = self
            .db
            .lock()
            .map_err(|_| ForgeError::Ledger("ledger mutex poisoned".to_string()))?;
        let mut stmt = db.prepare(
            "SELECT rule_id, severity, target_dn, timestamp, delta, remediation
             FROM answer_key ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (rule_id, severity, target_dn, timestamp, delta_json, remediation) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| ForgeError::Ledger(format!("bad timestamp in ledger: {}", e)))?
                .with_timezone(&Utc);
            let delta: BTreeMap<String, String> = serde_json::from_str(&delta_json)?;
            entries.push(LedgerEntry {
                rule_id,
                severity,
                target_dn,
                timestamp,
                delta,
                remediation,
            });
        }
        Ok(entries)
    }

    /// Number of entries recorded under this run's id
    pub fn run_entry_count(&self) -> Result<u64> {
        let db = self
            .db
            .lock()
            .map_err(|_| ForgeError::Ledger("ledger mutex poisoned".to_string()))?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM answer_key WHERE run_id = ?1",
            params![self.run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Recompute every row checksum and compare against the stored value
    pub fn verify_integrity(&self) -> Result<bool> {
        let db = self
            .db
            .lock()
            .map_err(|_| ForgeError::Ledger("ledger mutex poisoned".to_string()))?;
        let mut stmt = db.prepare(
            "SELECT run_id, rule_id, severity, target_dn, timestamp, delta, remediation, checksum
             FROM answer_key ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        for row in rows {
            let (run_id, rule_id, severity, target_dn, timestamp, delta_json, remediation, stored) =
                row?;
            let ts = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| ForgeError::Ledger(format!("bad timestamp in ledger: {}", e)))?
                .with_timezone(&Utc);
            let entry = LedgerEntry {
                rule_id,
                severity,
                target_dn,
                timestamp: ts,
                delta: serde_json::from_str(&delta_json)?,
                remediation,
            };
            if entry.checksum(&run_id)? != stored {
                warn!(rule_id = %entry.rule_id, target = %entry.target_dn, "ledger checksum mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write the full answer key as a JSON document
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let entries = self.entries()?;
        let export: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "target": e.target_dn,
                    "rule_id": e.rule_id,
                    "severity": e.severity,
                    "remediation": e.remediation,
                    "timestamp": e.timestamp.to_rfc3339(),
                    "delta": e.delta,
                })
            })
            .collect();
        let doc = serde_json::to_string_pretty(&export)?;
        std::fs::write(path, doc)
            .map_err(|e| ForgeError::Ledger(format!("answer key export failed: {}", e)))?;
        info!(path = %path.display(), entries = entries.len(), "answer key exported");
        Ok(())
    }
}
