//! Object population engine
//!
//! Plans the concrete objects for every OU's quota, then creates them
//! against the directory in dependency order: OUs level by level (parents
//! first), then groups, then users/computers/service accounts, then GPOs.
//! Creation within a stage runs on a bounded worker pool; a failed object
//! is marked Failed and excluded from every later stage while the run
//! continues.

use futures::future::join_all;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{CreateOutcome, DirectoryAdapter, RetryPolicy};
use crate::config::ForgeConfig;
use crate::hierarchy::OuTree;
use crate::model::{
    is_well_known_container, policies_container, DirectoryObject, ObjectStatus, ObjectType,
};
use crate::naming::{sam_account_name, NameGenerator};
use crate::registry::ObjectRegistry;
use crate::summary::{ItemOutcome, StageStats};

/// Default userAccountControl for an enabled user (NORMAL_ACCOUNT)
pub const UAC_NORMAL_ACCOUNT: u32 = 0x0200;
/// Default userAccountControl for a workstation (WORKSTATION_TRUST_ACCOUNT)
pub const UAC_WORKSTATION: u32 = 0x1000;

/// Expand the OU tree's quotas into concrete objects with attributes.
/// Deterministic for a given tree, generator and RNG state.
pub fn plan_objects<R: Rng + ?Sized>(
    tree: &OuTree,
    config: &ForgeConfig,
    names: &NameGenerator,
    rng: &mut R,
) -> Vec<DirectoryObject> {
    let mut objects = Vec::new();
    let ous = tree.flatten();
    let mut used_sams: HashSet<String> = HashSet::new();
    let mut computer_seq = 0u32;

    for ou in &ous {
        objects.push(DirectoryObject::new(
            ObjectType::Ou,
            &ou.name,
            parent_of(&ou.dn, &tree.base_dn),
            BTreeMap::from([(
                "description".to_string(),
                format!("{} organizational unit", ou.name),
            )]),
        ));
    }

    // Privileged groups come first so a fixed share of the total is marked
    let total_groups: u32 = ous.iter().map(|ou| ou.quotas.groups).sum();
    let privileged_target = if total_groups == 0 {
        0
    } else {
        ((f64::from(total_groups) * config.weaving.privileged_group_share).ceil() as u32).max(1)
    };
    let mut groups_planned = 0u32;

    for ou in &ous {
        let mut sibling_names: HashSet<String> = HashSet::new();
        for _ in 0..ou.quotas.groups {
            let privileged = groups_planned < privileged_target;
            let base = if privileged {
                names.privileged_group_name(rng)
            } else {
                names.group_name(rng)
            };
            let name = dedupe(&base, &mut sibling_names);
            let sam = unique_sam(&name.replace(' ', "-").to_lowercase(), &mut used_sams);
            let mut attrs = BTreeMap::from([
                ("sAMAccountName".to_string(), sam),
                // global security group
                ("groupType".to_string(), "-2147483646".to_string()),
            ]);
            if privileged {
                attrs.insert("adminCount".to_string(), "1".to_string());
                attrs.insert(
                    "description".to_string(),
                    "Administrative access group".to_string(),
                );
            }
            objects.push(DirectoryObject::new(ObjectType::Group, &name, &ou.dn, attrs));
            groups_planned += 1;
        }
    }

    for ou in &ous {
        let mut sibling_names: HashSet<String> = HashSet::new();
        for _ in 0..ou.quotas.users {
            let first = names.first_name(rng);
            let last = names.last_name(rng);
            let name = dedupe(&format!("{} {}", first, last), &mut sibling_names);
            let sam = unique_person_sam(&first, &last, &mut used_sams);
            let attrs = BTreeMap::from([
                ("givenName".to_string(), first.clone()),
                ("sn".to_string(), last.clone()),
                ("displayName".to_string(), name.clone()),
                ("sAMAccountName".to_string(), sam.clone()),
                (
                    "userPrincipalName".to_string(),
                    format!("{}@{}", sam, config.domain.name),
                ),
                ("department".to_string(), ou.name.clone()),
                ("title".to_string(), names.job_title(rng)),
                (
                    "userAccountControl".to_string(),
                    UAC_NORMAL_ACCOUNT.to_string(),
                ),
            ]);
            objects.push(DirectoryObject::new(ObjectType::User, &name, &ou.dn, attrs));
        }

        for _ in 0..ou.quotas.computers {
            computer_seq += 1;
            let name = format!("{}{:04}", names.computer_prefix(rng), computer_seq);
            let attrs = BTreeMap::from([
                ("sAMAccountName".to_string(), format!("{}$", name)),
                ("operatingSystem".to_string(), names.operating_system(rng)),
                (
                    "dNSHostName".to_string(),
                    format!("{}.{}", name.to_lowercase(), config.domain.name),
                ),
                ("userAccountControl".to_string(), UAC_WORKSTATION.to_string()),
            ]);
            objects.push(DirectoryObject::new(
                ObjectType::Computer,
                &name,
                &ou.dn,
                attrs,
            ));
        }

        for _ in 0..ou.quotas.service_accounts {
            let service = names.service_name(rng);
            let sam = unique_sam(&format!("svc-{}", service), &mut used_sams);
            let host = format!(
                "{}.{}",
                sam.replace("svc-", "app-"),
                config.domain.name
            );
            let attrs = BTreeMap::from([
                ("sAMAccountName".to_string(), sam.clone()),
                (
                    "userPrincipalName".to_string(),
                    format!("{}@{}", sam, config.domain.name),
                ),
                (
                    "servicePrincipalName".to_string(),
                    format!("{}/{}", service.to_uppercase(), host),
                ),
                ("description".to_string(), "Service account".to_string()),
                (
                    "userAccountControl".to_string(),
                    UAC_NORMAL_ACCOUNT.to_string(),
                ),
            ]);
            objects.push(DirectoryObject::new(
                ObjectType::ServiceAccount,
                &sam,
                &ou.dn,
                attrs,
            ));
        }
    }

    // GPOs live in the standard policies container; OU ownership is
    // expressed by the planned links
    let policies = policies_container(&tree.base_dn);
    let total_gpos: u32 = ous.iter().map(|ou| ou.quotas.gpos).sum();
    let mut gpo_display_names: HashSet<String> = HashSet::new();
    for _ in 0..total_gpos {
        // GUID drawn from the run RNG so the DN replays per seed
        let guid = format!("{{{}}}", Uuid::from_bytes(rng.gen()).to_string().to_uppercase());
        let display = dedupe(&names.gpo_name(rng), &mut gpo_display_names);
        let attrs = BTreeMap::from([
            ("displayName".to_string(), display),
            ("gPCFunctionalityVersion".to_string(), "2".to_string()),
            ("flags".to_string(), "0".to_string()),
        ]);
        objects.push(DirectoryObject::new(
            ObjectType::Gpo,
            &guid,
            &policies,
            attrs,
        ));
    }

    objects
}

// Strips the leading RDN at the first unescaped comma; escaped commas
// belong to the RDN value.
fn parent_of(dn: &str, base_dn: &str) -> String {
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return dn[i + 1..].to_string(),
            _ => escaped = false,
        }
    }
    base_dn.to_string()
}

fn dedupe(base: &str, used: &mut HashSet<String>) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{} {}", base, suffix);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn unique_sam(base: &str, used: &mut HashSet<String>) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{}{}", base, suffix);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn unique_person_sam(first: &str, last: &str, used: &mut HashSet<String>) -> String {
    let mut discriminator = 0u32;
    loop {
        let sam = sam_account_name(first, last, discriminator);
        if used.insert(sam.clone()) {
            return sam;
        }
        discriminator += 1;
    }
}

/// Creates planned objects through the adapter on a bounded worker pool
pub struct PopulationEngine {
    adapter: Arc<dyn DirectoryAdapter>,
    registry: Arc<ObjectRegistry>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    base_dn: String,
}

impl PopulationEngine {
    pub fn new(
        adapter: Arc<dyn DirectoryAdapter>,
        registry: Arc<ObjectRegistry>,
        retry: RetryPolicy,
        concurrency: usize,
        cancel: CancellationToken,
        base_dn: String,
    ) -> Self {
        Self {
            adapter,
            registry,
            retry,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
            base_dn,
        }
    }

    /// Create every planned object, respecting the inter-type order.
    /// Returns per-stage stats keyed "ous", "groups", "principals", "gpos".
    pub async fn run(&self, objects: &[DirectoryObject]) -> BTreeMap<String, StageStats> {
        let mut stats: BTreeMap<String, StageStats> = BTreeMap::new();

        // OUs go level by level so parents are confirmed before children
        let mut ou_levels: BTreeMap<usize, Vec<DirectoryObject>> = BTreeMap::new();
        let mut groups = Vec::new();
        let mut principals = Vec::new();
        let mut gpos = Vec::new();
        for obj in objects {
            match obj.object_type {
                ObjectType::Ou => ou_levels
                    .entry(obj.ou_depth())
                    .or_default()
                    .push(obj.clone()),
                ObjectType::Group => groups.push(obj.clone()),
                ObjectType::User | ObjectType::Computer | ObjectType::ServiceAccount => {
                    principals.push(obj.clone())
                }
                ObjectType::Gpo => gpos.push(obj.clone()),
            }
        }

        let mut ou_stats = StageStats::default();
        for (_, level) in ou_levels {
            ou_stats.merge(self.create_batch(level).await);
        }
        stats.insert("ous".to_string(), ou_stats);

        stats.insert("groups".to_string(), self.create_batch(groups).await);
        stats.insert(
            "principals".to_string(),
            self.create_batch(principals).await,
        );
        stats.insert("gpos".to_string(), self.create_batch(gpos).await);

        let (pending, created, failed) = self.registry.status_counts();
        info!(
            created,
            failed, pending, "object population finished"
        );
        stats
    }

    async fn create_batch(&self, objects: Vec<DirectoryObject>) -> StageStats {
        let futures: Vec<_> = objects
            .into_iter()
            .map(|obj| {
                let adapter = Arc::clone(&self.adapter);
                let registry = Arc::clone(&self.registry);
                let retry = self.retry.clone();
                let semaphore = Arc::clone(&self.semaphore);
                let cancel = self.cancel.clone();
                let base_dn = self.base_dn.clone();

                async move {
                    if cancel.is_cancelled() {
                        return ItemOutcome::Skipped;
                    }
                    // A child of a failed OU can never be created
                    if !is_well_known_container(&obj.parent_dn, &base_dn)
                        && !registry.is_created(&obj.parent_dn)
                    {
                        warn!(
                            dn = %obj.dn,
                            parent = %obj.parent_dn,
                            "skipping object: parent container was not created"
                        );
                        registry.set_status(&obj.dn, ObjectStatus::Failed);
                        return ItemOutcome::Skipped;
                    }

                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return ItemOutcome::Skipped,
                    };
                    if cancel.is_cancelled() {
                        return ItemOutcome::Skipped;
                    }

                    match retry
                        .execute("create_object", || adapter.create_object(&obj))
                        .await
                    {
                        Ok(CreateOutcome::Created) => {
                            registry.set_status(&obj.dn, ObjectStatus::Created);
                            ItemOutcome::Succeeded
                        }
                        Ok(CreateOutcome::AlreadyExists) => {
                            registry.set_status(&obj.dn, ObjectStatus::Created);
                            ItemOutcome::AlreadyExisted
                        }
                        Err(err) => {
                            warn!(
                                dn = %obj.dn,
                                stage = "population",
                                error = %err,
                                "object creation failed"
                            );
                            registry.set_status(&obj.dn, ObjectStatus::Failed);
                            ItemOutcome::Failed
                        }
                    }
                }
            })
            .collect();

        let mut stats = StageStats::default();
        for outcome in join_all(futures).await {
            stats.record(outcome);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockDirectory;
    use crate::hierarchy::build_tree;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn plan_for(config: &ForgeConfig, seed: u64) -> Vec<DirectoryObject> {
        let names = NameGenerator::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let tree = build_tree(config, &names, &mut rng).unwrap();
        plan_objects(&tree, config, &names, &mut rng)
    }

    fn engine(
        adapter: Arc<dyn DirectoryAdapter>,
        registry: Arc<ObjectRegistry>,
    ) -> PopulationEngine {
        PopulationEngine::new(
            adapter,
            registry,
            RetryPolicy::default(),
            4,
            CancellationToken::new(),
            "DC=range,DC=local".to_string(),
        )
    }

    #[test]
    fn test_plan_matches_requested_counts() {
        let mut config = ForgeConfig::default();
        config.counts = crate::config::ObjectCounts {
            ous: 5,
            groups: 8,
            users: 30,
            computers: 10,
            service_accounts: 3,
            gpos: 6,
        };
        let objects = plan_for(&config, 1);
        let count = |t| objects.iter().filter(|o| o.object_type == t).count();
        assert_eq!(count(ObjectType::Ou), 5);
        assert_eq!(count(ObjectType::Group), 8);
        assert_eq!(count(ObjectType::User), 30);
        assert_eq!(count(ObjectType::Computer), 10);
        assert_eq!(count(ObjectType::ServiceAccount), 3);
        assert_eq!(count(ObjectType::Gpo), 6);
    }

    #[test]
    fn test_parent_of_skips_escaped_commas() {
        let base = "DC=range,DC=local";
        let ou = DirectoryObject::new(
            ObjectType::Ou,
            "Sales, EMEA",
            base,
            BTreeMap::new(),
        );
        assert_eq!(ou.dn, "OU=Sales\\, EMEA,DC=range,DC=local");
        assert_eq!(parent_of(&ou.dn, base), base);
        let child = DirectoryObject::new(ObjectType::Group, "Reps", &ou.dn, BTreeMap::new());
        assert_eq!(parent_of(&child.dn, base), ou.dn);
    }

    #[test]
    fn test_plan_replays_identically_per_seed() {
        let config = ForgeConfig::default();
        let a = plan_for(&config, 9);
        let b = plan_for(&config, 9);
        let dns = |objs: &[DirectoryObject]| -> Vec<String> {
            objs.iter().map(|o| o.dn.clone()).collect()
        };
        // holds for every type, the GPO GUIDs included
        assert_eq!(dns(&a), dns(&b));
        assert!(a.iter().any(|o| o.object_type == ObjectType::Gpo));
    }

    #[test]
    fn test_planned_dns_are_unique() {
        let objects = plan_for(&ForgeConfig::default(), 2);
        let mut dns = HashSet::new();
        for obj in &objects {
            assert!(dns.insert(obj.dn.clone()), "duplicate DN {}", obj.dn);
        }
    }

    #[test]
    fn test_sams_are_unique() {
        let objects = plan_for(&ForgeConfig::default(), 3);
        let mut sams = HashSet::new();
        for obj in &objects {
            if let Some(sam) = obj.attributes.get("sAMAccountName") {
                assert!(sams.insert(sam.clone()), "duplicate sAMAccountName {}", sam);
            }
        }
    }

    #[test]
    fn test_some_groups_are_privileged() {
        let mut config = ForgeConfig::default();
        config.counts.groups = 20;
        config.weaving.privileged_group_share = 0.2;
        let objects = plan_for(&config, 4);
        let privileged = objects
            .iter()
            .filter(|o| {
                o.object_type == ObjectType::Group
                    && o.attributes.get("adminCount").map(String::as_str) == Some("1")
            })
            .count();
        assert_eq!(privileged, 4);
    }

    #[tokio::test]
    async fn test_population_creates_everything_on_clean_directory() {
        let mut config = ForgeConfig::default();
        config.counts = crate::config::ObjectCounts {
            ous: 3,
            groups: 2,
            users: 10,
            computers: 0,
            service_accounts: 0,
            gpos: 3,
        };
        config.hierarchy.max_depth = 1;
        config.hierarchy.max_branching = 4;
        let objects = plan_for(&config, 5);

        let dir = Arc::new(MockDirectory::new());
        let registry = Arc::new(ObjectRegistry::new());
        for obj in &objects {
            registry.insert(obj.clone());
        }
        let stats = engine(dir.clone(), registry.clone()).run(&objects).await;

        assert_eq!(stats["ous"].succeeded, 3);
        assert_eq!(stats["groups"].succeeded, 2);
        assert_eq!(stats["principals"].succeeded, 10);
        assert_eq!(stats["gpos"].succeeded, 3);
        assert_eq!(dir.object_count(), 18);
        let (_, created, failed) = registry.status_counts();
        assert_eq!(created, 18);
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn test_children_of_failed_ou_are_excluded() {
        let mut config = ForgeConfig::default();
        config.counts = crate::config::ObjectCounts {
            ous: 2,
            groups: 0,
            users: 8,
            computers: 0,
            service_accounts: 0,
            gpos: 1,
        };
        config.hierarchy.max_depth = 1;
        config.hierarchy.max_branching = 2;
        let objects = plan_for(&config, 6);

        // Fail an OU that has children; everything inside it must be skipped
        let failed_ou = objects
            .iter()
            .filter(|o| o.object_type == ObjectType::Ou)
            .find(|ou| objects.iter().any(|o| o.parent_dn == ou.dn))
            .map(|o| o.dn.clone())
            .unwrap();

        let dir = Arc::new(MockDirectory::new());
        dir.fail_permanently_on(&failed_ou);
        let registry = Arc::new(ObjectRegistry::new());
        for obj in &objects {
            registry.insert(obj.clone());
        }
        let stats = engine(dir.clone(), registry.clone()).run(&objects).await;

        assert_eq!(stats["ous"].failed, 1);
        let children_in_failed: Vec<_> = objects
            .iter()
            .filter(|o| o.parent_dn == failed_ou)
            .collect();
        assert!(!children_in_failed.is_empty());
        for child in children_in_failed {
            assert_eq!(
                registry.status(&child.dn),
                Some(ObjectStatus::Failed),
                "{} should be excluded",
                child.dn
            );
            assert!(!dir.has_object(&child.dn));
        }
    }

    #[tokio::test]
    async fn test_rerun_reports_already_exists_and_creates_nothing() {
        let mut config = ForgeConfig::default();
        config.counts.users = 20;
        let objects = plan_for(&config, 7);

        let dir = Arc::new(MockDirectory::new());
        let registry = Arc::new(ObjectRegistry::new());
        for obj in &objects {
            registry.insert(obj.clone());
        }
        engine(dir.clone(), registry.clone()).run(&objects).await;
        let after_first = dir.object_count();

        // Second run against the populated directory
        let registry2 = Arc::new(ObjectRegistry::new());
        for obj in &objects {
            registry2.insert(obj.clone());
        }
        let stats = engine(dir.clone(), registry2).run(&objects).await;
        assert_eq!(dir.object_count(), after_first);
        let total: u64 = stats.values().map(|s| s.already_existed).sum();
        assert_eq!(total, after_first as u64);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_work() {
        let objects = plan_for(&ForgeConfig::default(), 8);
        let dir = Arc::new(MockDirectory::new());
        let registry = Arc::new(ObjectRegistry::new());
        for obj in &objects {
            registry.insert(obj.clone());
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = PopulationEngine::new(
            dir.clone(),
            registry,
            RetryPolicy::default(),
            4,
            cancel,
            "DC=range,DC=local".to_string(),
        );
        let stats = engine.run(&objects).await;
        assert_eq!(dir.object_count(), 0);
        let skipped: u64 = stats.values().map(|s| s.skipped).sum();
        assert_eq!(skipped, objects.len() as u64);
    }
}
