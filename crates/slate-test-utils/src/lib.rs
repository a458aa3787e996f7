//! Testing utilities for the Navy Slate workspace
//!
//! Shared fixtures: a seeded in-memory backend with a linked couple, and
//! clients wired to an in-memory mirror and a recording notifier.

#![allow(missing_docs)]

use slate_cache::{FileMirror, MirrorStore};
use slate_core::{
    Entity, Points, Profile, Punishment, PunishmentDraft, RecordId, Reward, RewardDraft, Role, Rule,
    RuleDraft, SlateConfig, Task, TaskDraft, UserId,
};
use slate_remote::{MemoryBackend, Table};
use slate_sync::{Connectivity, RecordingNotifier, SlateClient};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Submissive test user
pub const SUB: &str = "sub-0001";
/// Dominant test user
pub const DOM: &str = "dom-0001";

/// [`SUB`] as a user id
pub fn sub() -> UserId {
    UserId::new(SUB)
}

/// [`DOM`] as a user id
pub fn dom() -> UserId {
    UserId::new(DOM)
}

/// Backend with a linked submissive/dominant pair
pub fn seeded_backend(sub_points: Points) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());

    let mut me = Profile::new(sub(), Role::Submissive);
    me.points = sub_points;
    me.linked_partner_id = Some(dom());
    let mut partner = Profile::new(dom(), Role::Dominant);
    partner.linked_partner_id = Some(sub());

    seed_row(&backend, Table::Profiles, &me);
    seed_row(&backend, Table::Profiles, &partner);
    backend
}

/// Insert `row` into `table` without gating
pub fn seed_row<T: serde::Serialize>(backend: &MemoryBackend, table: Table, row: &T) {
    let value = serde_json::to_value(row).unwrap();
    backend.seed(table, value).unwrap();
}

fn seed_entity<E: Entity>(backend: &MemoryBackend, entity: E) -> E {
    seed_row(backend, Table::for_kind(E::KIND), &entity);
    entity
}

/// Daily task worth `points`
pub fn seed_task(backend: &MemoryBackend, id: &str, title: &str, points: Points) -> Task {
    seed_entity(backend, Task::from_draft(RecordId::new(id), &TaskDraft::new(title, points)))
}

/// Rule with default settings
pub fn seed_rule(backend: &MemoryBackend, id: &str, title: &str) -> Rule {
    seed_entity(backend, Rule::from_draft(RecordId::new(id), &RuleDraft::new(title)))
}

/// Reward costing `cost` with `supply` units
pub fn seed_reward(backend: &MemoryBackend, id: &str, cost: Points, supply: u32) -> Reward {
    let mut draft = RewardDraft::new(format!("reward {id}"), cost);
    draft.supply = supply;
    seed_entity(backend, Reward::from_draft(RecordId::new(id), &draft))
}

/// Punishment deducting `points`
pub fn seed_punishment(backend: &MemoryBackend, id: &str, points: Points) -> Punishment {
    seed_entity(
        backend,
        Punishment::from_draft(RecordId::new(id), &PunishmentDraft::new(format!("punishment {id}"), points)),
    )
}

/// Client for [`SUB`] plus the handles tests inspect
pub struct TestClient {
    /// Client for [`SUB`]
    pub client: SlateClient,
    /// Backend the client talks to
    pub backend: Arc<MemoryBackend>,
    /// Notices the client raised
    pub notifier: RecordingNotifier,
    /// Mirror the client persists to
    pub mirror: MirrorStore,
    /// Connectivity flag the client watches
    pub connectivity: Connectivity,
}

/// Client over `backend` with an in-memory mirror
pub fn test_client(backend: &Arc<MemoryBackend>) -> TestClient {
    test_client_with_mirror(backend, MirrorStore::in_memory(Duration::from_secs(3600)))
}

/// Client over `backend` persisting to `mirror`
pub fn test_client_with_mirror(backend: &Arc<MemoryBackend>, mirror: MirrorStore) -> TestClient {
    build_test_client(backend, mirror, SlateConfig::default())
}

/// Like [`test_client`], with `config` instead of the defaults
pub fn test_client_with_config(backend: &Arc<MemoryBackend>, config: SlateConfig) -> TestClient {
    build_test_client(backend, MirrorStore::in_memory(Duration::from_secs(3600)), config)
}

fn build_test_client(backend: &Arc<MemoryBackend>, mirror: MirrorStore, config: SlateConfig) -> TestClient {
    let notifier = RecordingNotifier::new();
    let connectivity = Connectivity::new(true);
    let client = SlateClient::builder(sub(), backend.clone())
        .config(config)
        .mirror(mirror.clone())
        .notifier(Arc::new(notifier.clone()))
        .connectivity(connectivity.clone())
        .build();
    TestClient {
        client,
        backend: backend.clone(),
        notifier,
        mirror,
        connectivity,
    }
}

/// File mirror in a fresh temporary directory
pub fn temp_mirror(ttl: Duration) -> (TempDir, MirrorStore) {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MirrorStore::new(Arc::new(FileMirror::new(dir.path())), ttl);
    (dir, mirror)
}
