//! End-to-end client flows against the in-memory backend

use pretty_assertions::assert_eq;
use slate_core::{
    PointsBalance, RecordId, Reward, SlateConfig, SlateError, Task, ValidationError,
};
use slate_remote::{AdjustPointsArgs, ProfileAccessor, Table, PUSH_FUNCTION};
use slate_sync::{keys, NoticeLevel, Source};
use slate_test_utils::{
    dom, seed_punishment, seed_reward, seed_task, seeded_backend, sub, temp_mirror, test_client,
    test_client_with_config, test_client_with_mirror, TestClient,
};
use std::time::Duration;

/// Sync settings that keep the timer out of the way
fn quiet_sync() -> SlateConfig {
    SlateConfig::default()
        .with_initial_delay(Duration::from_secs(3600))
        .with_sync_interval(Duration::from_secs(3600))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

fn cached_balance(tc: &TestClient) -> PointsBalance {
    tc.client.cache().get_data(&keys::points(&sub())).unwrap()
}

fn server_points(tc: &TestClient) -> i64 {
    tc.backend.row(Table::Profiles, &sub().to_string()).unwrap()["points"]
        .as_i64()
        .unwrap()
}

async fn load(tc: &TestClient) {
    tc.client.hydrate().await;
    tc.client.balance().await.unwrap();
}

#[tokio::test]
async fn test_purchase_below_cost_touches_nothing() {
    let backend = seeded_backend(30);
    seed_reward(&backend, "w1", 50, 0);
    let tc = test_client(&backend);
    load(&tc).await;
    let rewards_before: Vec<Reward> = tc.client.cache().get_data(&keys::collection::<Reward>()).unwrap();
    backend.reset_calls();

    let err = tc.client.rewards().buy(&RecordId::new("w1")).await.unwrap_err();

    assert_eq!(
        err,
        SlateError::ValidationFailed(ValidationError::InsufficientPoints {
            required: 50,
            available: 30,
        })
    );
    assert_eq!(backend.total_calls(), 0);
    assert_eq!(cached_balance(&tc), PointsBalance::new(30, 0));
    let rewards_after: Vec<Reward> = tc.client.cache().get_data(&keys::collection::<Reward>()).unwrap();
    assert_eq!(rewards_after, rewards_before);
    assert_eq!(tc.notifier.with_level(NoticeLevel::Error).len(), 1);
}

#[tokio::test]
async fn test_completion_credits_then_failure_rolls_back() {
    let backend = seeded_backend(10);
    seed_task(&backend, "t1", "Dishes", 5);
    seed_task(&backend, "t2", "Laundry", 5);
    let tc = test_client(&backend);
    load(&tc).await;

    tc.client.tasks().complete(&RecordId::new("t1")).await.unwrap();
    assert_eq!(cached_balance(&tc).points, 15);
    assert_eq!(server_points(&tc), 15);

    backend.fail_writes_every(1);
    let err = tc.client.tasks().complete(&RecordId::new("t2")).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(cached_balance(&tc).points, 15);
    assert_eq!(server_points(&tc), 15);
    let tasks: Vec<Task> = tc.client.cache().get_data(&keys::collection::<Task>()).unwrap();
    let t2 = tasks.iter().find(|task| task.id.as_str() == "t2").unwrap();
    assert_eq!(t2.last_completed_date, None);
    assert_eq!(tc.notifier.with_level(NoticeLevel::Error).len(), 1);
}

#[tokio::test]
async fn test_completion_failing_late_can_be_retried() {
    for fail_every in [2, 3] {
        let backend = seeded_backend(10);
        seed_task(&backend, "t1", "Dishes", 5);
        let tc = test_client(&backend);
        load(&tc).await;
        backend.fail_writes_every(fail_every);

        assert!(tc.client.tasks().complete(&RecordId::new("t1")).await.is_err());
        assert_eq!(server_points(&tc), 10);
        assert!(backend.rows(Table::TaskCompletionHistory).is_empty());
        assert_eq!(backend.row(Table::Tasks, "t1").unwrap()["completed"], false);

        backend.fail_writes_every(0);
        tc.client.tasks().complete(&RecordId::new("t1")).await.unwrap();
        assert_eq!(server_points(&tc), 15);
        assert_eq!(backend.rows(Table::TaskCompletionHistory).len(), 1);
    }
}

#[tokio::test]
async fn test_punishment_failing_late_is_not_charged_twice() {
    let backend = seeded_backend(20);
    seed_punishment(&backend, "p1", 10);
    let tc = test_client(&backend);
    load(&tc).await;
    backend.fail_writes_every(2);

    assert!(tc.client.punishments().apply(&RecordId::new("p1")).await.is_err());
    assert_eq!(server_points(&tc), 20);

    backend.fail_writes_every(0);
    let balance = tc.client.punishments().apply(&RecordId::new("p1")).await.unwrap();
    assert_eq!(balance.points, 10);
    assert_eq!(server_points(&tc), 10);
    assert_eq!(backend.rows(Table::PunishmentHistory).len(), 1);
}

#[tokio::test]
async fn test_offline_completion_waits_for_reconnect() {
    let backend = seeded_backend(10);
    seed_task(&backend, "t1", "Dishes", 5);
    let tc = test_client_with_config(&backend, quiet_sync());
    load(&tc).await;
    let handle = tc.client.start_sync(None);

    tc.connectivity.set_online(false);
    let client = tc.client.clone();
    let completion = tokio::spawn(async move { client.tasks().complete(&RecordId::new("t1")).await });

    let paused = tc.client.paused().clone();
    eventually(|| paused.pending() == 1).await;
    assert_eq!(cached_balance(&tc).points, 15);
    assert_eq!(server_points(&tc), 10);

    tc.connectivity.set_online(true);
    completion.await.unwrap().unwrap();

    assert_eq!(server_points(&tc), 15);
    assert_eq!(tc.client.paused().pending(), 0);
    assert_eq!(tc.client.sync_manager().stats().forced_syncs, 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_remote_profile_change_refreshes_balance() {
    let backend = seeded_backend(10);
    let tc = test_client_with_config(&backend, quiet_sync());
    load(&tc).await;
    let handle = tc.client.start_sync(Some(backend.subscribe_changes()));
    tokio::task::yield_now().await;

    ProfileAccessor::new(backend.clone())
        .adjust_points(&AdjustPointsArgs::new(sub(), 7, 0))
        .await
        .unwrap();

    let manager = tc.client.sync_manager().clone();
    eventually(|| manager.stats().realtime_invalidations == 1).await;
    eventually(|| cached_balance(&tc).points == 17).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_partner_is_told_about_completions() {
    let backend = seeded_backend(0);
    seed_task(&backend, "t1", "Dishes", 5);
    let tc = test_client(&backend);
    load(&tc).await;

    let partnership = tc.client.refresh_profile().await.unwrap();
    assert_eq!(partnership.partner.map(|partner| partner.id), Some(dom()));

    tc.client.tasks().complete(&RecordId::new("t1")).await.unwrap();

    let pushes = backend.invocations(PUSH_FUNCTION);
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0]["targetUserId"], dom().to_string());
    assert_eq!(pushes[0]["type"], "task_completed");
}

#[tokio::test]
async fn test_failed_sync_cycle_reports_attempts() {
    let backend = seeded_backend(10);
    let config = quiet_sync().with_points_retry(2, Duration::from_millis(5));
    let tc = test_client_with_config(&backend, config);
    backend.set_offline(true);

    let err = tc.client.sync_manager().sync_now().await.unwrap_err();

    assert!(matches!(err, SlateError::SyncCycleFailed { attempts: 2, .. }));
    assert_eq!(tc.notifier.with_level(NoticeLevel::Warning).len(), 1);
    assert_eq!(tc.client.sync_manager().stats().cycles_failed, 1);
}

#[tokio::test]
async fn test_restart_offline_shows_mirrored_tasks() {
    let backend = seeded_backend(10);
    seed_task(&backend, "t1", "Dishes", 5);
    let (_dir, mirror) = temp_mirror(Duration::from_secs(3600));

    let first = test_client_with_mirror(&backend, mirror.clone());
    first.client.hydrate().await;

    backend.set_offline(true);
    let second = test_client_with_mirror(&backend, mirror);
    let outcomes = second.client.hydrate().await;

    let tasks = outcomes
        .iter()
        .find(|outcome| outcome.kind == slate_core::EntityKind::Task)
        .unwrap();
    assert_eq!(tasks.source, Source::Mirror);
    assert!(!tasks.refreshed);
    let cached: Vec<Task> = second.client.cache().get_data(&keys::collection::<Task>()).unwrap();
    assert_eq!(cached.len(), 1);
    assert!(second.client.cache().is_stale(&keys::collection::<Task>()));
}
