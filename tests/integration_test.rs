//! End-to-end runs against the in-memory directory

use std::sync::Arc;
use tempfile::tempdir;

use rangeforge::adapter::mock::MockDirectory;
use rangeforge::config::ObjectCounts;
use rangeforge::model::{ObjectStatus, ObjectType};
use rangeforge::{plan, ForgeConfig, ForgeEngine, RelationshipKind};

fn base_config(tmp: &std::path::Path, seed: u64) -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.counts = ObjectCounts {
        ous: 3,
        groups: 2,
        users: 10,
        computers: 0,
        service_accounts: 0,
        gpos: 3,
    };
    config.hierarchy.max_depth = 1;
    config.hierarchy.max_branching = 4;
    config.injection.default_fraction = 0.0;
    config
        .injection
        .sampling
        .insert("user-password-never-expires".to_string(), 0.5);
    config.seed = seed;
    config.output.ledger_db = tmp.join("answer_key.db");
    config.output.answer_key = tmp.join("answer_key.json");
    config.output.run_summary = Some(tmp.join("summary.json"));
    config
}

#[tokio::test]
async fn test_small_domain_end_to_end() {
    let tmp = tempdir().unwrap();
    let config = base_config(tmp.path(), 100);
    let dir = Arc::new(MockDirectory::new());
    let engine = ForgeEngine::new(config.clone(), dir.clone()).unwrap();
    let summary = engine.run().await.unwrap();

    // 3 OUs + 2 groups + 10 users + 3 GPOs
    assert_eq!(dir.object_count(), 18);
    let totals = summary.objects_total();
    assert_eq!(totals.succeeded, 18);
    assert_eq!(totals.failed, 0);

    // one rule at half sampling over ten eligible users
    assert_eq!(summary.ledger_entries, 5);
    assert_eq!(summary.misconfigurations.succeeded, 5);

    // exported artifacts exist and agree with the ledger
    let key: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.output.answer_key).unwrap())
            .unwrap();
    assert_eq!(key.as_array().unwrap().len(), 5);
    let written: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(config.output.run_summary.as_ref().unwrap()).unwrap(),
    )
    .unwrap();
    assert_eq!(written["ledger_entries"], 5);

    // every seeded account actually carries the flag in the directory
    for entry in key.as_array().unwrap() {
        let dn = entry["target"].as_str().unwrap();
        let uac: u32 = dir.attribute(dn, "userAccountControl").unwrap().parse().unwrap();
        assert_ne!(uac & 0x10000, 0, "{} missing DONT_EXPIRE_PASSWORD", dn);
    }
}

#[tokio::test]
async fn test_gpo_rule_samples_half_of_linked_gpos() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 110);
    config.injection.sampling.clear();
    config
        .injection
        .sampling
        .insert("gpo-grants-delegation-privilege".to_string(), 0.5);
    let dir = Arc::new(MockDirectory::new());
    let engine = ForgeEngine::new(config, dir.clone()).unwrap();
    let summary = engine.run().await.unwrap();

    // three GPOs at half sampling rounds up to two
    assert_eq!(summary.ledger_entries, 2);
    let key: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(tmp.path().join("answer_key.json")).unwrap(),
    )
    .unwrap();
    for entry in key.as_array().unwrap() {
        assert_eq!(entry["rule_id"], "gpo-grants-delegation-privilege");
        assert_eq!(entry["severity"], "high");
        assert!(entry["remediation"].as_str().unwrap().contains("GPO"));
        let dn = entry["target"].as_str().unwrap();
        assert!(dn.contains("CN=Policies,CN=System"));
        assert!(dir.attribute(dn, "seEnableDelegationPrivilege").is_some());
    }
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let tmp = tempdir().unwrap();
    let config = base_config(tmp.path(), 101);
    let dir = Arc::new(MockDirectory::new());

    let first = ForgeEngine::new(config.clone(), dir.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    let created_objects = dir.object_count();
    let created_relationships = dir.relationship_count();
    assert_eq!(first.objects_total().succeeded, created_objects as u64);

    // Same config, same seed, same target: nothing new is created and
    // nothing is double-seeded.
    let second = ForgeEngine::new(config, dir.clone())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(dir.object_count(), created_objects);
    assert_eq!(dir.relationship_count(), created_relationships);
    assert_eq!(second.objects_total().succeeded, 0);
    assert_eq!(
        second.objects_total().already_existed,
        created_objects as u64
    );
    assert_eq!(second.misconfigurations.succeeded, 0);
    assert_eq!(second.ledger_entries, 0);
    assert_eq!(
        second.misconfigurations.already_existed,
        first.misconfigurations.succeeded
    );
}

#[tokio::test]
async fn test_failed_subtree_is_contained() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 102);
    config.counts.computers = 4;
    let the_plan = plan(&config).unwrap();
    let failed_ou = the_plan
        .objects
        .iter()
        .filter(|o| o.object_type == ObjectType::Ou)
        .find(|ou| the_plan.objects.iter().any(|o| o.parent_dn == ou.dn))
        .map(|o| o.dn.clone())
        .unwrap();

    let dir = Arc::new(MockDirectory::new());
    dir.fail_permanently_on(&failed_ou);
    let engine = ForgeEngine::new(config, dir.clone()).unwrap();
    let summary = engine.run().await.unwrap();

    // the failed OU and everything planned inside it is absent, the rest
    // of the domain is intact
    assert!(!dir.has_object(&failed_ou));
    let mut contained = 0;
    for obj in &the_plan.objects {
        if obj.dn == failed_ou || obj.parent_dn == failed_ou {
            assert!(!dir.has_object(&obj.dn));
            assert_eq!(engine.registry().status(&obj.dn), Some(ObjectStatus::Failed));
            contained += 1;
        } else {
            assert!(dir.has_object(&obj.dn), "{} should exist", obj.dn);
        }
    }
    assert!(contained > 1);
    assert_eq!(summary.objects_total().failed, 1);

    // no relationship touches the failed OU or anything under it
    let inside = |dn: &str| dn == failed_ou || dn.ends_with(&format!(",{}", failed_ou));
    for rel in engine.registry().relationships() {
        assert!(!inside(&rel.from), "relationship from {}", rel.from);
        assert!(!inside(&rel.to), "relationship to {}", rel.to);
    }
}

#[tokio::test]
async fn test_relationships_only_touch_created_objects() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 103);
    config.counts.users = 20;
    config.counts.groups = 5;
    let dir = Arc::new(MockDirectory::new());
    let engine = ForgeEngine::new(config, dir.clone()).unwrap();
    engine.run().await.unwrap();

    for rel in engine.registry().relationships() {
        assert!(dir.has_object(&rel.from), "dangling from {}", rel.from);
        assert!(dir.has_object(&rel.to), "dangling to {}", rel.to);
        assert!(dir.has_relationship(rel.kind, &rel.from, &rel.to));
    }
}

#[tokio::test]
async fn test_every_gpo_ends_up_linked() {
    let tmp = tempdir().unwrap();
    let config = base_config(tmp.path(), 104);
    let dir = Arc::new(MockDirectory::new());
    let engine = ForgeEngine::new(config, dir.clone()).unwrap();
    engine.run().await.unwrap();

    let gpos: Vec<_> = engine.registry().created_of_type(ObjectType::Gpo);
    assert_eq!(gpos.len(), 3);
    for gpo in gpos {
        assert!(
            engine
                .registry()
                .relationships()
                .iter()
                .any(|r| r.kind == RelationshipKind::GpoLink && r.to == gpo.dn),
            "{} has no OU link",
            gpo.dn
        );
    }
}

#[tokio::test]
async fn test_cancelled_run_records_only_confirmed_changes() {
    let tmp = tempdir().unwrap();
    let config = base_config(tmp.path(), 105);
    let dir = Arc::new(MockDirectory::new());
    let engine = ForgeEngine::new(config, dir.clone()).unwrap();
    engine.cancellation_token().cancel();
    let summary = engine.run().await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(dir.object_count(), 0);
    assert_eq!(dir.relationship_count(), 0);
    assert_eq!(summary.ledger_entries, 0);
    // the answer key is still exported, just empty for this run
    let key: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(tmp.path().join("answer_key.json")).unwrap(),
    )
    .unwrap();
    assert!(key.as_array().unwrap().is_empty());
}

#[test]
fn test_plan_mode_touches_no_directory_state() {
    let tmp = tempdir().unwrap();
    let config = base_config(tmp.path(), 106);
    let the_plan = plan(&config).unwrap();

    assert_eq!(the_plan.count_of(ObjectType::Ou), 3);
    assert_eq!(the_plan.count_of(ObjectType::User), 10);
    assert_eq!(the_plan.planned_misconfigs.len(), 5);
    assert!(!the_plan.relationships.is_empty());
    // plan mode writes nothing
    assert!(!tmp.path().join("answer_key.db").exists());
    assert!(!tmp.path().join("answer_key.json").exists());
}
