//! Optimistic mutation properties
//!
//! Failed mutations leave the cache exactly as they found it, and created
//! records end up in the cache once, under their server id.

use futures::future::join_all;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use slate_core::{
    Entity, PunishmentDraft, PunishmentPatch, RecordId, RewardDraft, RewardPatch, Rule, RuleDraft,
    RulePatch, TaskDraft, TaskPatch,
};
use slate_sync::CollectionMutator;
use slate_test_utils::{
    seed_punishment, seed_reward, seed_rule, seed_task, seeded_backend, test_client, TestClient,
};

fn cached_bytes<E: Entity>(tc: &TestClient, mutator: &CollectionMutator<E>) -> Vec<u8> {
    let items: Vec<E> = tc.client.cache().get_data(mutator.key()).unwrap();
    serde_json::to_vec(&items).unwrap()
}

/// Create, update and delete against a backend that rejects every write
async fn assert_failed_mutations_roll_back<E: Entity>(
    tc: &TestClient,
    mutator: &CollectionMutator<E>,
    draft: E::Draft,
    patch: E::Patch,
) {
    let loaded: Vec<E> = tc.client.cache().fetch(mutator.key()).await.unwrap();
    let existing = loaded[0].id().clone();
    let before = cached_bytes(tc, mutator);
    tc.backend.fail_writes_every(1);

    assert!(mutator.create(draft).await.is_err());
    assert_eq!(cached_bytes(tc, mutator), before);

    assert!(mutator.update(&existing, patch).await.is_err());
    assert_eq!(cached_bytes(tc, mutator), before);

    assert!(mutator.delete(&existing).await.is_err());
    assert_eq!(cached_bytes(tc, mutator), before);

    tc.backend.fail_writes_every(0);
}

#[tokio::test]
async fn test_failed_mutations_restore_every_collection() {
    let backend = seeded_backend(10);
    seed_task(&backend, "t1", "Dishes", 5);
    seed_rule(&backend, "r1", "Bedtime");
    seed_reward(&backend, "w1", 20, 1);
    seed_punishment(&backend, "p1", 10);
    let tc = test_client(&backend);
    let client = &tc.client;

    assert_failed_mutations_roll_back(
        &tc,
        client.tasks().collection(),
        TaskDraft::new("Laundry", 3),
        TaskPatch {
            points: Some(50),
            ..TaskPatch::default()
        },
    )
    .await;
    assert_failed_mutations_roll_back(
        &tc,
        client.rules().collection(),
        RuleDraft::new("No phones"),
        RulePatch {
            title: Some("Phones away".into()),
            ..RulePatch::default()
        },
    )
    .await;
    assert_failed_mutations_roll_back(
        &tc,
        client.rewards().collection(),
        RewardDraft::new("Movie", 40),
        RewardPatch {
            cost: Some(1),
            ..RewardPatch::default()
        },
    )
    .await;
    assert_failed_mutations_roll_back(
        &tc,
        client.punishments().collection(),
        PunishmentDraft::new("Lines", 10),
        PunishmentPatch {
            points: Some(99),
            ..PunishmentPatch::default()
        },
    )
    .await;

    assert_eq!(tc.notifier.notices().len(), 12);
}

#[tokio::test]
async fn test_concurrent_creates_each_land_once() {
    let backend = seeded_backend(0);
    let tc = test_client(&backend);
    let rules = tc.client.rules().collection();
    let _: Vec<Rule> = tc.client.cache().fetch(rules.key()).await.unwrap();

    let created = join_all((0..5).map(|i| rules.create(RuleDraft::new(format!("rule {i}"))))).await;
    let created: Vec<Rule> = created.into_iter().map(Result::unwrap).collect();

    let cached: Vec<Rule> = tc.client.cache().get_data(rules.key()).unwrap();
    assert!(cached.iter().all(|rule| !rule.id.is_placeholder()));
    for rule in &created {
        assert_eq!(cached.iter().filter(|cached| cached.id == rule.id).count(), 1);
    }
    assert_eq!(cached.len(), 5);
}

#[tokio::test]
async fn test_overlapping_success_and_failure_keep_the_success() {
    let backend = seeded_backend(0);
    let tc = test_client(&backend);
    let rules = tc.client.rules().collection();
    let _: Vec<Rule> = tc.client.cache().fetch(rules.key()).await.unwrap();
    backend.set_latency(std::time::Duration::from_millis(10));
    backend.fail_writes_every(2);

    let (a, b) = tokio::join!(rules.create(RuleDraft::new("a")), rules.create(RuleDraft::new("b")));

    let landed = match (a, b) {
        (Ok(rule), Err(_)) | (Err(_), Ok(rule)) => rule,
        other => panic!("expected one success and one failure, got {other:?}"),
    };
    let cached: Vec<Rule> = tc.client.cache().get_data(rules.key()).unwrap();
    assert_eq!(cached, vec![landed]);
    assert_eq!(backend.rows(slate_remote::Table::Rules).len(), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Create(String),
    Rename(usize, String),
    Delete(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,12}".prop_map(Op::Create),
        (0usize..4, "[a-z]{1,12}").prop_map(|(i, title)| Op::Rename(i, title)),
        (0usize..4).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_failed_rule_mutations_never_change_the_cache(ops in proptest::collection::vec(op(), 1..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let backend = seeded_backend(0);
            for i in 0..4 {
                seed_rule(&backend, &format!("r{i}"), &format!("rule {i}"));
            }
            let tc = test_client(&backend);
            let rules = tc.client.rules().collection();
            let _: Vec<Rule> = tc.client.cache().fetch(rules.key()).await.unwrap();
            let before = cached_bytes(&tc, rules);
            backend.fail_writes_every(1);

            for op in ops {
                let result = match op {
                    Op::Create(title) => rules.create(RuleDraft::new(title)).await.map(|_| ()),
                    Op::Rename(i, title) => {
                        let patch = RulePatch { title: Some(title), ..RulePatch::default() };
                        rules.update(&RecordId::new(format!("r{i}")), patch).await.map(|_| ())
                    }
                    Op::Delete(i) => rules.delete(&RecordId::new(format!("r{i}"))).await,
                };
                assert!(result.is_err());
                assert_eq!(cached_bytes(&tc, rules), before);
            }
        });
    }

    #[test]
    fn prop_created_tasks_replace_their_placeholders(count in 1usize..6) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let backend = seeded_backend(0);
            let tc = test_client(&backend);
            let tasks = tc.client.tasks().collection();
            let _: Vec<slate_core::Task> = tc.client.cache().fetch(tasks.key()).await.unwrap();

            for i in 0..count {
                let created = tasks.create(TaskDraft::new(format!("task {i}"), 1)).await.unwrap();
                let cached: Vec<slate_core::Task> = tc.client.cache().get_data(tasks.key()).unwrap();

                assert!(!created.id.is_placeholder());
                assert!(cached.iter().all(|task| !task.id.is_placeholder()));
                assert_eq!(cached.iter().filter(|task| task.id == created.id).count(), 1);
                assert_eq!(cached.len(), i + 1);
            }
        });
    }
}
