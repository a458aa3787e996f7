use pretty_assertions::assert_eq;
use slate_core::{Entity, Punishment, PunishmentDraft, PunishmentPatch, RecordId, Rule, RuleDraft};
use slate_remote::{Backend, ChangeKind, MemoryBackend, Operation, RemoteAccessor, Table};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_crud_lifecycle_publishes_changes() {
    let backend = Arc::new(MemoryBackend::new());
    let mut changes = backend.subscribe_changes();
    let punishments = RemoteAccessor::<Punishment>::new(backend.clone());

    let created = punishments.create(&PunishmentDraft::new("Lines", 10)).await.unwrap();
    let patch = PunishmentPatch {
        points: Some(12),
        ..PunishmentPatch::default()
    };
    let updated = punishments.update(created.id(), &patch).await.unwrap();
    punishments.delete(created.id()).await.unwrap();

    let kinds: Vec<ChangeKind> = (0..3).map(|_| changes.try_recv().unwrap().kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    assert_eq!(updated.points, 12);
    assert_eq!(updated.dom_points, 5);
    assert!(punishments.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_each_accessor_call_is_one_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    let rules = RemoteAccessor::<Rule>::new(backend.clone());

    rules.create(&RuleDraft::new("Bedtime")).await.unwrap();
    rules.list().await.unwrap();

    assert_eq!(backend.calls(Operation::Insert), 1);
    assert_eq!(backend.calls(Operation::Select), 1);
    assert_eq!(backend.table_calls(Table::Rules), 2);
}

#[tokio::test]
async fn test_failed_create_is_not_retried() {
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_next(slate_core::RemoteError::network("reset"));
    let rules = RemoteAccessor::<Rule>::new(backend.clone());

    assert!(rules.create(&RuleDraft::new("Bedtime")).await.is_err());
    assert_eq!(backend.calls(Operation::Insert), 1);
    assert!(backend.rows(Table::Rules).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_latency_is_applied_per_call() {
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(200)));
    let started = tokio::time::Instant::now();

    backend
        .delete(Table::Tasks, &RecordId::new("missing"))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
}
