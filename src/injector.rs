//! Misconfiguration injection
//!
//! Walks the rule catalog against the registry of created objects, samples
//! eligible targets per configured fraction and applies each rule's delta
//! through the adapter. A change is recorded in the answer-key ledger only
//! after the directory confirms it; a ledger write failure aborts the run.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{DirectoryAdapter, RetryPolicy};
use crate::config::ForgeConfig;
use crate::ledger::AnswerKeyLedger;
use crate::model::PlannedMisconfig;
use crate::naming::NameGenerator;
use crate::registry::ObjectRegistry;
use crate::rules::{catalog, MisconfigRule, RuleEffect};
use crate::summary::{ItemOutcome, StageStats};

/// Preview which rule applications a seeded run would attempt. Used by
/// plan mode; execution re-samples against what was actually created.
pub fn plan_misconfigs(
    registry: &ObjectRegistry,
    config: &ForgeConfig,
    rng: &mut StdRng,
) -> Vec<PlannedMisconfig> {
    let mut planned = Vec::new();
    for rule in catalog() {
        for target_dn in sample_targets(&rule, registry, config, rng) {
            planned.push(PlannedMisconfig {
                rule_id: rule.id.to_string(),
                target_dn,
            });
        }
    }
    planned
}

fn sample_targets(
    rule: &MisconfigRule,
    registry: &ObjectRegistry,
    config: &ForgeConfig,
    rng: &mut StdRng,
) -> Vec<String> {
    let fraction = config.sampling_fraction(rule.id);
    if fraction <= 0.0 {
        return Vec::new();
    }
    // created_of_type is DN-sorted, so sampling is reproducible per seed
    let eligible: Vec<String> = registry
        .created_of_type(rule.target)
        .into_iter()
        .filter(|obj| (rule.predicate)(obj, registry))
        .map(|obj| obj.dn)
        .collect();
    if eligible.is_empty() {
        return Vec::new();
    }
    let count = ((eligible.len() as f64) * fraction).round() as usize;
    let count = count.min(eligible.len());
    let mut chosen: Vec<String> = eligible
        .choose_multiple(rng, count)
        .cloned()
        .collect();
    chosen.sort();
    chosen
}

pub struct MisconfigurationInjector {
    adapter: Arc<dyn DirectoryAdapter>,
    registry: Arc<ObjectRegistry>,
    ledger: Arc<AnswerKeyLedger>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl MisconfigurationInjector {
    pub fn new(
        adapter: Arc<dyn DirectoryAdapter>,
        registry: Arc<ObjectRegistry>,
        ledger: Arc<AnswerKeyLedger>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            registry,
            ledger,
            retry,
            cancel,
        }
    }

    /// Apply the catalog. Sequential by design: each application must be
    /// confirmed and recorded before the next begins, so a ledger entry
    /// never exists for an unconfirmed change.
    pub async fn run(
        &self,
        config: &ForgeConfig,
        names: &NameGenerator,
        rng: &mut StdRng,
    ) -> crate::errors::Result<StageStats> {
        let mut stats = StageStats::default();

        for rule in catalog() {
            if self.cancel.is_cancelled() {
                break;
            }
            let targets = sample_targets(&rule, &self.registry, config, rng);
            if targets.is_empty() {
                debug!(rule = rule.id, "no eligible targets");
                continue;
            }
            info!(rule = rule.id, targets = targets.len(), "seeding rule");

            for target_dn in targets {
                if self.cancel.is_cancelled() {
                    stats.record(ItemOutcome::Skipped);
                    continue;
                }
                if self.ledger.already_applied(rule.id, &target_dn)? {
                    debug!(rule = rule.id, target = %target_dn, "already seeded by an earlier run");
                    stats.record(ItemOutcome::AlreadyExisted);
                    continue;
                }
                let Some(target) = self.registry.get(&target_dn) else {
                    stats.record(ItemOutcome::Skipped);
                    continue;
                };
                let Some(effect) = (rule.apply)(&target, &self.registry, names, rng) else {
                    stats.record(ItemOutcome::Skipped);
                    continue;
                };
                match self.apply_effect(&target_dn, &effect).await {
                    Ok(()) => {
                        // Confirmed against the directory: record or die
                        self.ledger.record(
                            rule.id,
                            rule.severity,
                            &target_dn,
                            effect.delta(),
                            rule.remediation,
                        )?;
                        stats.record(ItemOutcome::Succeeded);
                    }
                    Err(err) => {
                        warn!(
                            rule = rule.id,
                            target = %target_dn,
                            stage = "injection",
                            error = %err,
                            "rule application failed"
                        );
                        stats.record(ItemOutcome::Failed);
                    }
                }
            }
        }

        info!(
            seeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "misconfiguration injection finished"
        );
        Ok(stats)
    }

    async fn apply_effect(&self, target_dn: &str, effect: &RuleEffect) -> crate::errors::Result<()> {
        match effect {
            RuleEffect::SetAttributes(attrs) => {
                self.retry
                    .execute("set_attributes", || {
                        self.adapter.set_attributes(target_dn, attrs)
                    })
                    .await?;
                self.registry.apply_delta(target_dn, attrs);
            }
            RuleEffect::AddRelationship(rel) => {
                self.retry
                    .execute("create_relationship", || {
                        self.adapter.create_relationship(rel)
                    })
                    .await?;
                self.registry.add_relationship(rel.clone());
            }
        }
        Ok(())
    }
}
