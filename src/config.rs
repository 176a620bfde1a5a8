//! Run configuration
//!
//! A single structured document covering object counts, hierarchy bounds,
//! weaving and injection tuning, execution limits, output paths, and the
//! optional directory connection. `validate()` runs before any directory
//! write and reports every violation it finds, not just the first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{ForgeError, Result};
use crate::naming::WeightedEntry;

/// Hard cap on OU tree depth regardless of configuration
pub const MAX_OU_DEPTH: u8 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub domain: DomainConfig,
    pub counts: ObjectCounts,
    pub hierarchy: HierarchyBounds,
    pub weaving: WeavingConfig,
    pub injection: InjectionConfig,
    pub execution: ExecutionConfig,
    pub output: OutputConfig,
    /// Directory connection; optional so dry-run plans need no server
    pub connection: Option<ConnectionConfig>,
    /// Overrides for the built-in naming distributions
    pub naming: BTreeMap<String, Vec<WeightedEntry>>,
    /// Seed for all generation randomness; identical configs replay
    /// identically
    pub seed: u64,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            domain: DomainConfig::default(),
            counts: ObjectCounts::default(),
            hierarchy: HierarchyBounds::default(),
            weaving: WeavingConfig::default(),
            injection: InjectionConfig::default(),
            execution: ExecutionConfig::default(),
            output: OutputConfig::default(),
            connection: None,
            naming: BTreeMap::new(),
            seed: 0xC0FFEE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// DNS name of the fabricated domain, used for UPN suffixes
    pub name: String,
    /// Base DN of the target; all generated DNs hang under it
    pub base_dn: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: "range.local".to_string(),
            base_dn: "DC=range,DC=local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectCounts {
    pub ous: u32,
    pub groups: u32,
    pub users: u32,
    pub computers: u32,
    pub service_accounts: u32,
    pub gpos: u32,
}

impl Default for ObjectCounts {
    fn default() -> Self {
        Self {
            ous: 12,
            groups: 40,
            users: 500,
            computers: 150,
            service_accounts: 10,
            gpos: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyBounds {
    /// Maximum OU nesting depth (1 = flat, hard cap 8)
    pub max_depth: u8,
    /// Maximum children per OU (and per the domain root)
    pub max_branching: u8,
    /// Quota skew exponent; 1.0 = even spread, higher values concentrate
    /// objects in fewer OUs
    pub skew: f64,
}

impl Default for HierarchyBounds {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_branching: 6,
            skew: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WeavingConfig {
    /// Maximum group-nesting chain length
    pub max_nesting_depth: u8,
    /// Probability a group is nested under an earlier group
    pub nesting_probability: f64,
    /// Fraction of principals steered into privileged groups
    pub privileged_fraction: f64,
    /// Share of groups fabricated as privileged (adminCount=1)
    pub privileged_group_share: f64,
    /// Maximum direct group memberships per principal
    pub max_memberships: u8,
    /// Probability an OU gets a second GPO link
    pub extra_gpo_link_probability: f64,
    /// Fraction of OUs that receive a baseline delegation ACE
    pub delegation_fraction: f64,
}

impl Default for WeavingConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 3,
            nesting_probability: 0.3,
            privileged_fraction: 0.05,
            privileged_group_share: 0.1,
            max_memberships: 3,
            extra_gpo_link_probability: 0.25,
            delegation_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Sampling fraction applied to rules not listed in `sampling`
    pub default_fraction: f64,
    /// Per-rule sampling fraction overrides, keyed by rule id; 0 disables
    /// a rule
    pub sampling: BTreeMap<String, f64>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            default_fraction: 0.05,
            sampling: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Bounded worker pool size; keep small enough to respect directory
    /// rate limits
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Failure-rate threshold for the OU stage above which the run exits
    /// non-zero
    pub critical_failure_threshold: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            retry: RetryConfig::default(),
            critical_failure_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// SQLite ledger database; every confirmed injection is flushed here
    pub ledger_db: PathBuf,
    /// JSON answer key exported at run completion
    pub answer_key: PathBuf,
    /// Optional JSON run summary
    pub run_summary: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            ledger_db: PathBuf::from("answer_key.db"),
            answer_key: PathBuf::from("answer_key.json"),
            run_summary: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// ldap:// or ldaps:// URL of the target domain controller
    pub url: String,
    pub bind_dn: String,
    pub password: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    15
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Number of OUs a tree with the given bounds can host
pub fn ou_capacity(max_depth: u8, max_branching: u8) -> u64 {
    let b = max_branching as u64;
    let mut level = 1u64;
    let mut total = 0u64;
    for _ in 0..max_depth {
        level = level.saturating_mul(b);
        total = total.saturating_add(level);
    }
    total
}

fn check_fraction(violations: &mut Vec<String>, name: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        violations.push(format!("{} must be within [0, 1], got {}", name, value));
    }
}

impl ForgeConfig {
    /// Parse a configuration document from JSON
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ForgeError::config(format!("cannot parse configuration: {}", e)))
    }

    /// Validate the whole document, collecting every violation
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();

        if self.domain.base_dn.trim().is_empty() {
            violations.push("domain.base_dn must not be empty".to_string());
        }
        if self.domain.name.trim().is_empty() {
            violations.push("domain.name must not be empty".to_string());
        }

        if self.hierarchy.max_depth == 0 || self.hierarchy.max_depth > MAX_OU_DEPTH {
            violations.push(format!(
                "hierarchy.max_depth must be within 1..={}, got {}",
                MAX_OU_DEPTH, self.hierarchy.max_depth
            ));
        }
        if self.hierarchy.max_branching == 0 {
            violations.push("hierarchy.max_branching must be at least 1".to_string());
        }
        if self.hierarchy.skew <= 0.0 || !self.hierarchy.skew.is_finite() {
            violations.push(format!(
                "hierarchy.skew must be a positive finite number, got {}",
                self.hierarchy.skew
            ));
        }

        if self.counts.ous == 0 {
            violations.push("counts.ous must be at least 1".to_string());
        }
        if self.counts.gpos == 0 {
            violations.push(
                "counts.gpos must be at least 1 (every OU receives a GPO link)".to_string(),
            );
        }
        let capacity = ou_capacity(self.hierarchy.max_depth, self.hierarchy.max_branching);
        if u64::from(self.counts.ous) > capacity {
            violations.push(format!(
                "counts.ous ({}) exceeds tree capacity {} for depth {} / branching {}",
                self.counts.ous,
                capacity,
                self.hierarchy.max_depth,
                self.hierarchy.max_branching
            ));
        }

        check_fraction(
            &mut violations,
            "weaving.nesting_probability",
            self.weaving.nesting_probability,
        );
        check_fraction(
            &mut violations,
            "weaving.privileged_fraction",
            self.weaving.privileged_fraction,
        );
        check_fraction(
            &mut violations,
            "weaving.privileged_group_share",
            self.weaving.privileged_group_share,
        );
        check_fraction(
            &mut violations,
            "weaving.extra_gpo_link_probability",
            self.weaving.extra_gpo_link_probability,
        );
        check_fraction(
            &mut violations,
            "weaving.delegation_fraction",
            self.weaving.delegation_fraction,
        );
        if self.weaving.max_nesting_depth == 0 {
            violations.push("weaving.max_nesting_depth must be at least 1".to_string());
        }
        if self.weaving.max_memberships == 0 {
            violations.push("weaving.max_memberships must be at least 1".to_string());
        }

        check_fraction(
            &mut violations,
            "injection.default_fraction",
            self.injection.default_fraction,
        );
        for (rule_id, fraction) in &self.injection.sampling {
            check_fraction(
                &mut violations,
                &format!("injection.sampling[{}]", rule_id),
                *fraction,
            );
        }

        if self.execution.concurrency == 0 {
            violations.push("execution.concurrency must be at least 1".to_string());
        }
        if self.execution.retry.max_attempts == 0 {
            violations.push("execution.retry.max_attempts must be at least 1".to_string());
        }
        check_fraction(
            &mut violations,
            "execution.critical_failure_threshold",
            self.execution.critical_failure_threshold,
        );

        if let Some(conn) = &self.connection {
            if conn.url.trim().is_empty() {
                violations.push("connection.url must not be empty".to_string());
            }
            if conn.bind_dn.trim().is_empty() {
                violations.push("connection.bind_dn must not be empty".to_string());
            }
        }

        for (name, entries) in &self.naming {
            if entries.is_empty() {
                violations.push(format!("naming.{} must not be empty", name));
            } else if entries.iter().all(|e| e.weight == 0) {
                violations.push(format!("naming.{} has no positive weights", name));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::Config { violations })
        }
    }

    /// Sampling fraction for a rule id, falling back to the default
    pub fn sampling_fraction(&self, rule_id: &str) -> f64 {
        self.injection
            .sampling
            .get(rule_id)
            .copied()
            .unwrap_or(self.injection.default_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ForgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_capacity_formula() {
        // depth 2, branching 3: 3 + 9
        assert_eq!(ou_capacity(2, 3), 12);
        assert_eq!(ou_capacity(1, 5), 5);
    }

    #[test]
    fn test_validate_collects_all_violations() {
        let mut config = ForgeConfig::default();
        config.hierarchy.max_depth = 12;
        config.execution.concurrency = 0;
        config.weaving.privileged_fraction = 1.5;
        let err = config.validate().unwrap_err();
        match err {
            crate::errors::ForgeError::Config { violations } => {
                assert_eq!(violations.len(), 3, "violations: {:?}", violations);
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_ou_count_exceeding_capacity_rejected() {
        let mut config = ForgeConfig::default();
        config.hierarchy.max_depth = 1;
        config.hierarchy.max_branching = 2;
        config.counts.ous = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_sampling_fallback() {
        let mut config = ForgeConfig::default();
        config.injection.default_fraction = 0.2;
        config
            .injection
            .sampling
            .insert("user-asrep-roastable".to_string(), 0.5);
        assert_eq!(config.sampling_fraction("user-asrep-roastable"), 0.5);
        assert_eq!(config.sampling_fraction("anything-else"), 0.2);
    }

    #[test]
    fn test_from_json_roundtrip() {
        let text = r#"{
            "counts": { "ous": 3, "users": 10, "groups": 2, "gpos": 3 },
            "hierarchy": { "max_depth": 1, "max_branching": 4 },
            "seed": 99
        }"#;
        let config = ForgeConfig::from_json(text).unwrap();
        assert_eq!(config.counts.ous, 3);
        assert_eq!(config.counts.users, 10);
        assert_eq!(config.seed, 99);
        // unspecified sections fall back to defaults
        assert_eq!(config.execution.retry.max_attempts, 4);
        config.validate().unwrap();
    }
}
