//! Relationship weaving
//!
//! Plans and applies the connective tissue between created objects:
//! group nesting, principal memberships, GPO links to OUs and delegation
//! grants on OUs. Planning is deterministic for a given RNG; execution
//! only touches endpoints the registry confirmed as Created and rejects
//! membership edges that would close a nesting cycle.

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{CreateOutcome, DirectoryAdapter, RetryPolicy};
use crate::config::ForgeConfig;
use crate::model::{DirectoryObject, ObjectType, Relationship, RelationshipKind};
use crate::registry::ObjectRegistry;
use crate::summary::{ItemOutcome, StageStats};

/// Delegation rights considered routine administration rather than a
/// seeded finding. The injector grants the dangerous ones.
const BENIGN_DELEGATION_RIGHTS: &[&str] = &["ResetPassword", "GenericWrite", "WriteMembers"];

/// Plan the relationship set for a planned object population.
pub fn plan_relationships<R: Rng + ?Sized>(
    objects: &[DirectoryObject],
    config: &ForgeConfig,
    rng: &mut R,
) -> Vec<Relationship> {
    let ous: Vec<&DirectoryObject> = of_type(objects, ObjectType::Ou);
    let groups: Vec<&DirectoryObject> = of_type(objects, ObjectType::Group);
    let gpos: Vec<&DirectoryObject> = of_type(objects, ObjectType::Gpo);
    let principals: Vec<&DirectoryObject> = objects
        .iter()
        .filter(|o| {
            matches!(
                o.object_type,
                ObjectType::User | ObjectType::Computer | ObjectType::ServiceAccount
            )
        })
        .collect();
    let privileged: Vec<&&DirectoryObject> = groups
        .iter()
        .filter(|g| g.attributes.get("adminCount").map(String::as_str) == Some("1"))
        .collect();

    let mut relationships = Vec::new();
    let mut seen: HashSet<(RelationshipKind, String, String)> = HashSet::new();
    let mut push = |rels: &mut Vec<Relationship>, rel: Relationship| {
        if seen.insert((rel.kind, rel.from.clone(), rel.to.clone())) {
            rels.push(rel);
        }
    };

    // Group nesting: each group may join an earlier group in planning
    // order, which keeps the planned graph acyclic. Chain depth is
    // tracked so no nesting path exceeds the configured bound.
    let mut chain_depth: Vec<u32> = vec![1; groups.len()];
    for i in 1..groups.len() {
        if !rng.gen_bool(config.weaving.nesting_probability) {
            continue;
        }
        let parent_idx = rng.gen_range(0..i);
        if chain_depth[parent_idx] + 1 > u32::from(config.weaving.max_nesting_depth) {
            continue;
        }
        chain_depth[i] = chain_depth[parent_idx] + 1;
        push(
            &mut relationships,
            Relationship::new(
                RelationshipKind::Membership,
                groups[parent_idx].dn.clone(),
                groups[i].dn.clone(),
            ),
        );
    }

    // Principal memberships. A small fraction of principals lands in a
    // privileged group, which the injector later exploits.
    if !groups.is_empty() {
        for principal in &principals {
            let count = rng.gen_range(1..=config.weaving.max_memberships.max(1));
            for _ in 0..count {
                let group = if !privileged.is_empty()
                    && rng.gen_bool(config.weaving.privileged_fraction)
                {
                    privileged[rng.gen_range(0..privileged.len())]
                } else {
                    &groups[rng.gen_range(0..groups.len())]
                };
                push(
                    &mut relationships,
                    Relationship::new(
                        RelationshipKind::Membership,
                        group.dn.clone(),
                        principal.dn.clone(),
                    ),
                );
            }
        }
    }

    // GPO links. Every OU receives at least one linked GPO; surplus GPOs
    // beyond the OU count are spread back over the OUs, and some OUs pick
    // up a further policy.
    if !gpos.is_empty() && !ous.is_empty() {
        for (i, ou) in ous.iter().enumerate() {
            let gpo = gpos[i % gpos.len()];
            push(
                &mut relationships,
                Relationship::new(RelationshipKind::GpoLink, ou.dn.clone(), gpo.dn.clone())
                    .with_attribute("linkOrder", "1"),
            );
        }
        for (j, gpo) in gpos.iter().enumerate().skip(ous.len()) {
            let ou = ous[j % ous.len()];
            push(
                &mut relationships,
                Relationship::new(RelationshipKind::GpoLink, ou.dn.clone(), gpo.dn.clone())
                    .with_attribute("linkOrder", "2"),
            );
        }
        for ou in &ous {
            if rng.gen_bool(config.weaving.extra_gpo_link_probability) {
                let gpo = gpos[rng.gen_range(0..gpos.len())];
                push(
                    &mut relationships,
                    Relationship::new(RelationshipKind::GpoLink, ou.dn.clone(), gpo.dn.clone())
                        .with_attribute("linkOrder", "3"),
                );
            }
        }
    }

    // Routine delegation grants on a fraction of OUs
    if !principals.is_empty() {
        let delegated = ((ous.len() as f64) * config.weaving.delegation_fraction).round() as usize;
        let mut chosen: Vec<&&DirectoryObject> = ous.iter().collect();
        chosen.shuffle(rng);
        for ou in chosen.into_iter().take(delegated) {
            let trustee = principals[rng.gen_range(0..principals.len())];
            let rights = BENIGN_DELEGATION_RIGHTS[rng.gen_range(0..BENIGN_DELEGATION_RIGHTS.len())];
            push(
                &mut relationships,
                Relationship::new(RelationshipKind::Delegation, ou.dn.clone(), trustee.dn.clone())
                    .with_attribute("rights", rights),
            );
        }
    }

    relationships
}

fn of_type(objects: &[DirectoryObject], t: ObjectType) -> Vec<&DirectoryObject> {
    objects.iter().filter(|o| o.object_type == t).collect()
}

/// Applies planned relationships through the adapter
pub struct RelationshipWeaver {
    adapter: Arc<dyn DirectoryAdapter>,
    registry: Arc<ObjectRegistry>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl RelationshipWeaver {
    pub fn new(
        adapter: Arc<dyn DirectoryAdapter>,
        registry: Arc<ObjectRegistry>,
        retry: RetryPolicy,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            registry,
            retry,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
        }
    }

    /// Apply the planned relationships. Group-to-group nesting runs
    /// sequentially so the cycle check sees every earlier edge; the rest
    /// runs on the worker pool.
    pub async fn run(&self, relationships: &[Relationship]) -> StageStats {
        let mut stats = StageStats::default();

        let (nesting, rest): (Vec<&Relationship>, Vec<&Relationship>) =
            relationships.iter().partition(|rel| {
                rel.kind == RelationshipKind::Membership
                    && self
                        .registry
                        .get(&rel.to)
                        .map(|o| o.object_type == ObjectType::Group)
                        .unwrap_or(false)
            });

        for rel in nesting {
            if self.cancel.is_cancelled() {
                stats.record(ItemOutcome::Skipped);
                continue;
            }
            if !self.endpoints_created(rel) {
                stats.record(ItemOutcome::Skipped);
                continue;
            }
            if self.registry.would_close_cycle(&rel.from, &rel.to) {
                debug!(group = %rel.from, member = %rel.to, "rejecting nesting edge: would close a cycle");
                stats.record(ItemOutcome::Rejected);
                continue;
            }
            stats.record(self.apply(rel).await);
        }

        let futures: Vec<_> = rest
            .into_iter()
            .map(|rel| {
                let semaphore = Arc::clone(&self.semaphore);
                let cancel = self.cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return ItemOutcome::Skipped;
                    }
                    if !self.endpoints_created(rel) {
                        return ItemOutcome::Skipped;
                    }
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return ItemOutcome::Skipped,
                    };
                    if cancel.is_cancelled() {
                        return ItemOutcome::Skipped;
                    }
                    self.apply(rel).await
                }
            })
            .collect();
        for outcome in join_all(futures).await {
            stats.record(outcome);
        }

        info!(
            applied = stats.successes(),
            failed = stats.failed,
            skipped = stats.skipped,
            rejected = stats.rejected,
            "relationship weaving finished"
        );
        stats
    }

    fn endpoints_created(&self, rel: &Relationship) -> bool {
        if self.registry.is_created(&rel.from) && self.registry.is_created(&rel.to) {
            return true;
        }
        warn!(
            from = %rel.from,
            to = %rel.to,
            kind = ?rel.kind,
            "skipping relationship: endpoint was not created"
        );
        false
    }

    async fn apply(&self, rel: &Relationship) -> ItemOutcome {
        match self
            .retry
            .execute("create_relationship", || {
                self.adapter.create_relationship(rel)
            })
            .await
        {
            Ok(outcome) => {
                self.registry.add_relationship(rel.clone());
                match outcome {
                    CreateOutcome::Created => ItemOutcome::Succeeded,
                    CreateOutcome::AlreadyExists => ItemOutcome::AlreadyExisted,
                }
            }
            Err(err) => {
                warn!(
                    from = %rel.from,
                    to = %rel.to,
                    kind = ?rel.kind,
                    stage = "weaving",
                    error = %err,
                    "relationship creation failed"
                );
                ItemOutcome::Failed
            }
        }
    }
}
