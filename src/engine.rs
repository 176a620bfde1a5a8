//! Run orchestration
//!
//! Drives a full fabrication run: plan the hierarchy and objects from the
//! seed, populate the directory, weave relationships, inject the
//! misconfiguration catalog, then export the answer key and summary.
//! Cancellation between stages leaves a consistent directory and a ledger
//! containing only confirmed changes.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{DirectoryAdapter, RetryPolicy};
use crate::config::ForgeConfig;
use crate::errors::{ForgeError, Result};
use crate::hierarchy::build_tree;
use crate::injector::{plan_misconfigs, MisconfigurationInjector};
use crate::ledger::AnswerKeyLedger;
use crate::model::{GenerationPlan, ObjectStatus};
use crate::naming::NameGenerator;
use crate::population::{plan_objects, PopulationEngine};
use crate::registry::ObjectRegistry;
use crate::summary::{RunSummary, StageStats};
use crate::weaver::{plan_relationships, RelationshipWeaver};

/// Produce the deterministic plan for a configuration without touching
/// any directory.
pub fn plan(config: &ForgeConfig) -> Result<GenerationPlan> {
    config.validate()?;
    let names = NameGenerator::with_overrides(&config.naming)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let tree = build_tree(config, &names, &mut rng)?;
    let objects = plan_objects(&tree, config, &names, &mut rng);
    let relationships = plan_relationships(&objects, config, &mut rng);

    // Preview sampling against a registry where every planned object is
    // assumed created
    let preview = ObjectRegistry::new();
    for obj in &objects {
        preview.insert(obj.clone());
        preview.set_status(&obj.dn, ObjectStatus::Created);
    }
    let mut preview_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let planned_misconfigs = plan_misconfigs(&preview, config, &mut preview_rng);

    Ok(GenerationPlan {
        base_dn: config.domain.base_dn.clone(),
        objects,
        relationships,
        planned_misconfigs,
    })
}

pub struct ForgeEngine {
    config: ForgeConfig,
    adapter: Arc<dyn DirectoryAdapter>,
    registry: Arc<ObjectRegistry>,
    ledger: Arc<AnswerKeyLedger>,
    cancel: CancellationToken,
}

impl ForgeEngine {
    pub fn new(config: ForgeConfig, adapter: Arc<dyn DirectoryAdapter>) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(AnswerKeyLedger::open(&config.output.ledger_db)?);
        Ok(Self {
            config,
            adapter,
            registry: Arc::new(ObjectRegistry::new()),
            ledger,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that aborts the run at the next safe point
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Execute a full run. Individual object and relationship failures
    /// are tolerated and reflected in the summary; configuration, ledger
    /// and connection-level errors abort.
    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::parse_str(self.ledger.run_id()).unwrap_or_else(|_| Uuid::new_v4());
        info!(run_id = %run_id, seed = self.config.seed, "fabrication run starting");

        let names = NameGenerator::with_overrides(&self.config.naming)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let tree = build_tree(&self.config, &names, &mut rng)?;
        let objects = plan_objects(&tree, &self.config, &names, &mut rng);
        let relationships = plan_relationships(&objects, &self.config, &mut rng);
        for obj in &objects {
            self.registry.insert(obj.clone());
        }
        info!(
            objects = objects.len(),
            relationships = relationships.len(),
            "plan ready"
        );

        let retry = RetryPolicy::new(&self.config.execution.retry);
        let concurrency = self.config.execution.concurrency;

        let population = PopulationEngine::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.registry),
            retry.clone(),
            concurrency,
            self.cancel.clone(),
            self.config.domain.base_dn.clone(),
        );
        let object_stats = population.run(&objects).await;

        let relationship_stats = if self.cancel.is_cancelled() {
            warn!("run cancelled before relationship weaving");
            StageStats::default()
        } else {
            let weaver = RelationshipWeaver::new(
                Arc::clone(&self.adapter),
                Arc::clone(&self.registry),
                retry.clone(),
                concurrency,
                self.cancel.clone(),
            );
            weaver.run(&relationships).await
        };

        let misconfig_stats = if self.cancel.is_cancelled() {
            warn!("run cancelled before misconfiguration injection");
            StageStats::default()
        } else {
            let injector = MisconfigurationInjector::new(
                Arc::clone(&self.adapter),
                Arc::clone(&self.registry),
                Arc::clone(&self.ledger),
                retry,
                self.cancel.clone(),
            );
            let mut inject_rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
            injector.run(&self.config, &names, &mut inject_rng).await?
        };

        self.ledger.export_json(&self.config.output.answer_key)?;
        if !self.ledger.verify_integrity()? {
            return Err(ForgeError::Ledger(
                "answer-key ledger failed integrity verification".to_string(),
            ));
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled: self.cancel.is_cancelled(),
            objects: object_stats,
            relationships: relationship_stats,
            misconfigurations: misconfig_stats,
            ledger_entries: self.ledger.run_entry_count()? as usize,
        };
        if let Some(path) = &self.config.output.run_summary {
            let doc = serde_json::to_string_pretty(&summary)?;
            std::fs::write(path, doc)
                .map_err(|e| ForgeError::Ledger(format!("summary export failed: {}", e)))?;
        }

        let totals = summary.objects_total();
        info!(
            run_id = %run_id,
            cancelled = summary.cancelled,
            objects_created = totals.successes(),
            objects_failed = totals.failed,
            relationships = summary.relationships.successes(),
            seeded = summary.misconfigurations.succeeded,
            "fabrication run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockDirectory;
    use crate::config::ObjectCounts;
    use tempfile::tempdir;

    fn small_config(tmp: &std::path::Path, seed: u64) -> ForgeConfig {
        let mut config = ForgeConfig::default();
        config.counts = ObjectCounts {
            ous: 3,
            groups: 4,
            users: 20,
            computers: 5,
            service_accounts: 2,
            gpos: 3,
        };
        config.hierarchy.max_depth = 2;
        config.hierarchy.max_branching = 3;
        config.seed = seed;
        config.output.ledger_db = tmp.join("key.db");
        config.output.answer_key = tmp.join("answer_key.json");
        config
    }

    #[test]
    fn test_plan_is_deterministic_per_seed() {
        let tmp = tempdir().unwrap();
        let config = small_config(tmp.path(), 42);
        let a = plan(&config).unwrap();
        let b = plan(&config).unwrap();
        let dns = |p: &GenerationPlan| p.objects.iter().map(|o| o.dn.clone()).collect::<Vec<_>>();
        assert_eq!(dns(&a), dns(&b));
        assert_eq!(a.relationships.len(), b.relationships.len());
        assert_eq!(a.planned_misconfigs.len(), b.planned_misconfigs.len());
    }

    #[test]
    fn test_different_seeds_differ() {
        let tmp = tempdir().unwrap();
        let a = plan(&small_config(tmp.path(), 1)).unwrap();
        let b = plan(&small_config(tmp.path(), 2)).unwrap();
        let dns = |p: &GenerationPlan| p.objects.iter().map(|o| o.dn.clone()).collect::<Vec<_>>();
        assert_ne!(dns(&a), dns(&b));
    }

    #[tokio::test]
    async fn test_full_run_against_mock_directory() {
        let tmp = tempdir().unwrap();
        let config = small_config(tmp.path(), 7);
        let dir = Arc::new(MockDirectory::new());
        let engine = ForgeEngine::new(config.clone(), dir.clone()).unwrap();
        let summary = engine.run().await.unwrap();

        assert!(!summary.cancelled);
        let totals = summary.objects_total();
        assert_eq!(totals.succeeded, 37);
        assert_eq!(totals.failed, 0);
        assert_eq!(dir.object_count(), 37);
        assert!(summary.relationships.successes() > 0);
        assert!(summary.ledger_entries > 0);
        assert_eq!(
            summary.ledger_entries as u64,
            summary.misconfigurations.succeeded
        );
        assert!(config.output.answer_key.exists());
        assert!(!summary.critical_failure(0.1));
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_creates_nothing() {
        let tmp = tempdir().unwrap();
        let config = small_config(tmp.path(), 8);
        let dir = Arc::new(MockDirectory::new());
        let engine = ForgeEngine::new(config, dir.clone()).unwrap();
        engine.cancellation_token().cancel();
        let summary = engine.run().await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(dir.object_count(), 0);
        assert_eq!(summary.ledger_entries, 0);
        assert_eq!(summary.relationships.attempted, 0);
        assert_eq!(summary.misconfigurations.attempted, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_up_front() {
        let tmp = tempdir().unwrap();
        let mut config = small_config(tmp.path(), 9);
        config.counts.ous = 0;
        let dir = Arc::new(MockDirectory::new());
        let err = ForgeEngine::new(config, dir).err();
        assert!(matches!(err, Some(ForgeError::Config { .. })));
    }
}
