//! Optimistic mutations
//!
//! Every mutation follows the same machine:
//!
//! 1. cancel in-flight fetches of each key it is about to edit
//! 2. snapshot those keys, or record how to revert the touched records
//! 3. apply the optimistic edit
//! 4. make the remote call (parked first while offline)
//! 5. on success write the server's records back and persist the edited
//!    collections to the local mirror
//! 6. on failure undo every edit, newest first, and raise a notice; no
//!    automatic retry. Collection edits undo only their own records so an
//!    overlapping mutation's records survive.
//! 7. either way invalidate the edited keys and their dependents
//!
//! [`MutationRunner::run`] is the generic machine. [`CollectionMutator`]
//! specializes it for create, update and delete on one entity collection.

use crate::connectivity::{Connectivity, PausedMutations};
use crate::notify::{Notice, Notifier};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use slate_cache::{MirrorStore, QueryCache, QueryKey, Restore};
use slate_core::{Entity, RecordId, SlateError, SlateResult, UserId, ValidationError};
use slate_remote::RemoteAccessor;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type PersistJob = Box<dyn FnOnce(&QueryCache, &MirrorStore, &UserId) -> Option<BoxFuture<'static, ()>> + Send + Sync>;

/// How to take back one optimistic edit
enum Undo {
    /// Put the whole entry back as it was
    Snapshot(Box<dyn Restore>),
    /// Revert only this mutation's change, applied to the entry as it is then
    Revert {
        key: QueryKey,
        revert: Box<dyn FnOnce(&QueryCache) + Send + Sync>,
    },
}

impl Undo {
    fn key(&self) -> &QueryKey {
        match self {
            Undo::Snapshot(snapshot) => snapshot.key(),
            Undo::Revert { key, .. } => key,
        }
    }

    fn apply(self, cache: &QueryCache) {
        match self {
            Undo::Snapshot(snapshot) => snapshot.restore(cache),
            Undo::Revert { revert, .. } => revert(cache),
        }
    }
}

/// Snapshots and bookkeeping of one in-flight mutation
///
/// Owned by exactly one call to [`MutationRunner::run`] and dropped when it
/// returns.
pub struct OptimisticContext<'a> {
    cache: &'a QueryCache,
    undo: Vec<Undo>,
    invalidate: Vec<QueryKey>,
    persist: Vec<PersistJob>,
}

impl<'a> OptimisticContext<'a> {
    fn new(cache: &'a QueryCache) -> Self {
        Self {
            cache,
            undo: Vec::new(),
            invalidate: Vec::new(),
            persist: Vec::new(),
        }
    }

    /// Cancel, snapshot and edit `key` in one step
    ///
    /// A key edited twice in one mutation is only snapshotted the first time.
    /// Rollback restores the whole entry, so use this for single values and
    /// the `*_record` edits for collections other mutations may share.
    pub fn edit<T, F>(&mut self, key: &QueryKey, f: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        self.cache.cancel_queries(key);
        let snapshotted = self
            .undo
            .iter()
            .any(|undo| matches!(undo, Undo::Snapshot(snapshot) if snapshot.key() == key));
        if !snapshotted {
            self.undo.push(Undo::Snapshot(Box::new(self.cache.snapshot::<T>(key))));
        }
        self.cache.update_data(key, f);
        self.invalidate(key.clone());
    }

    /// Cancel and edit `key`; on failure `revert` is applied to whatever the
    /// entry holds at that point
    pub fn edit_reverting<T, F, R>(&mut self, key: &QueryKey, f: F, revert: R)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> Option<T>,
        R: FnOnce(T) -> T + Send + Sync + 'static,
    {
        self.cache.cancel_queries(key);
        self.cache.update_data(key, f);
        let owned = key.clone();
        self.undo.push(Undo::Revert {
            key: key.clone(),
            revert: Box::new(move |cache| {
                cache.update_data::<T, _>(&owned, |value| value.map(revert));
            }),
        });
        self.invalidate(key.clone());
    }

    /// Append `record` to the collection under `key`; rollback removes it
    pub fn insert_record<E: Entity>(&mut self, key: &QueryKey, record: E) {
        let id = record.id().clone();
        self.edit_reverting::<Vec<E>, _, _>(
            key,
            |items| {
                items.map(|mut items| {
                    items.push(record);
                    items
                })
            },
            move |mut items| {
                items.retain(|item| item.id() != &id);
                items
            },
        );
    }

    /// Apply `edit` to record `id` of the collection under `key`
    ///
    /// Rollback puts that record back only while it still holds this edit,
    /// leaving newer edits by other mutations alone.
    pub fn edit_record<E, F>(&mut self, key: &QueryKey, id: &RecordId, edit: F)
    where
        E: Entity,
        F: FnOnce(&mut E),
    {
        let Some(original) = self.cached_record::<E>(key, id) else {
            self.cache.cancel_queries(key);
            self.invalidate(key.clone());
            return;
        };
        let mut edited = original.clone();
        edit(&mut edited);
        let staged = edited.clone();
        self.edit_reverting::<Vec<E>, _, _>(
            key,
            |items| items.map(|items| replace_by_id(items, &staged)),
            move |mut items| {
                if let Some(item) = items.iter_mut().find(|item| **item == edited) {
                    *item = original;
                }
                items
            },
        );
    }

    /// Remove record `id` from the collection under `key`; rollback puts it
    /// back at its old position unless it reappeared meanwhile
    pub fn remove_record<E: Entity>(&mut self, key: &QueryKey, id: &RecordId) {
        let Some((index, original)) = self.cache.get_data::<Vec<E>>(key).and_then(|items| {
            items
                .into_iter()
                .enumerate()
                .find(|(_, item)| item.id() == id)
        }) else {
            self.cache.cancel_queries(key);
            self.invalidate(key.clone());
            return;
        };
        self.edit_reverting::<Vec<E>, _, _>(
            key,
            |items| {
                items.map(|mut items| {
                    items.retain(|item| item.id() != id);
                    items
                })
            },
            move |mut items| {
                if !items.iter().any(|item| item.id() == original.id()) {
                    items.insert(index.min(items.len()), original);
                }
                items
            },
        );
    }

    fn cached_record<E: Entity>(&self, key: &QueryKey, id: &RecordId) -> Option<E> {
        self.cache
            .get_data::<Vec<E>>(key)?
            .into_iter()
            .find(|item| item.id() == id)
    }

    /// Invalidate `key` when the mutation finishes
    pub fn invalidate(&mut self, key: QueryKey) {
        if !self.invalidate.contains(&key) {
            self.invalidate.push(key);
        }
    }

    /// Write the value of `key` to the mirror as `collection` on success
    pub fn persist<T>(&mut self, key: &QueryKey, collection: &'static str)
    where
        T: Clone + Serialize + Send + Sync + 'static,
    {
        let key = key.clone();
        self.persist.push(Box::new(move |cache, mirror, user| {
            let items: T = cache.get_data(&key)?;
            let mirror = mirror.clone();
            let user = user.clone();
            Some(async move { mirror.save(&user, collection, &items).await }.boxed())
        }));
    }

    /// Keys touched so far
    #[must_use]
    pub fn touched(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = Vec::new();
        for undo in &self.undo {
            if !keys.contains(undo.key()) {
                keys.push(undo.key().clone());
            }
        }
        keys
    }

    fn rollback(&mut self) {
        for undo in std::mem::take(&mut self.undo).into_iter().rev() {
            undo.apply(self.cache);
        }
    }

    fn finish(&self) {
        for key in &self.invalidate {
            self.cache.invalidate(key);
        }
    }
}

/// Runs mutations against one cache
#[derive(Clone)]
pub struct MutationRunner {
    cache: QueryCache,
    notifier: Arc<dyn Notifier>,
    connectivity: Connectivity,
    paused: PausedMutations,
    mirror: Option<(MirrorStore, UserId)>,
}

impl MutationRunner {
    /// Runner over `cache` reporting through `notifier`
    #[must_use]
    pub fn new(cache: QueryCache, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            cache,
            notifier,
            connectivity: Connectivity::default(),
            paused: PausedMutations::new(),
            mirror: None,
        }
    }

    /// Park remote calls while `connectivity` is offline
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Connectivity, paused: PausedMutations) -> Self {
        self.connectivity = connectivity;
        self.paused = paused;
        self
    }

    /// Persist edited collections to `mirror` under `user`
    #[must_use]
    pub fn with_mirror(mut self, mirror: MirrorStore, user: UserId) -> Self {
        self.mirror = Some((mirror, user));
        self
    }

    /// Cache the runner edits
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Notice sink
    #[must_use]
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Mutations parked while offline
    #[must_use]
    pub fn paused(&self) -> &PausedMutations {
        &self.paused
    }

    /// Report a failed precondition without touching the cache
    ///
    /// # Errors
    /// Always; returns `error` as `ValidationFailed`
    pub fn reject<R>(&self, label: &str, error: ValidationError) -> SlateResult<R> {
        debug!(mutation = label, %error, "precondition failed");
        let error = SlateError::from(error);
        self.notifier
            .notify(Notice::error(format!("Could not {label}"), error.user_message()));
        Err(error)
    }

    /// Run one mutation
    ///
    /// `stage` applies the optimistic edit through the context, `remote`
    /// performs the network call, and `settle` writes the server's answer
    /// into the cache.
    ///
    /// # Errors
    /// The remote call's error, after the cache has been rolled back
    pub async fn run<R, Stage, Remote, Fut, Settle>(
        &self,
        label: &str,
        stage: Stage,
        remote: Remote,
        settle: Settle,
    ) -> SlateResult<R>
    where
        Stage: FnOnce(&mut OptimisticContext<'_>),
        Remote: FnOnce() -> Fut,
        Fut: Future<Output = SlateResult<R>>,
        Settle: FnOnce(&QueryCache, &R),
    {
        let mut ctx = OptimisticContext::new(&self.cache);
        stage(&mut ctx);

        if !self.connectivity.is_online() {
            info!(mutation = label, "offline, holding remote call");
            self.paused.park(&self.connectivity).await;
        }

        let result = remote().await;
        match &result {
            Ok(value) => {
                settle(&self.cache, value);
                self.persist(std::mem::take(&mut ctx.persist)).await;
                debug!(mutation = label, "mutation confirmed");
            }
            Err(error) => {
                warn!(mutation = label, %error, edits = ctx.undo.len(), "mutation failed, rolling back");
                ctx.rollback();
                self.notifier
                    .notify(Notice::error(format!("Could not {label}"), error.user_message()));
            }
        }

        ctx.finish();
        result
    }

    async fn persist(&self, jobs: Vec<PersistJob>) {
        let Some((mirror, user)) = &self.mirror else {
            return;
        };
        for job in jobs {
            if let Some(write) = job(&self.cache, mirror, user) {
                write.await;
            }
        }
    }
}

impl fmt::Debug for MutationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRunner")
            .field("online", &self.connectivity.is_online())
            .field("paused", &self.paused.pending())
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

/// Per-record mutation counter
///
/// A success response is only written back when no newer mutation on the
/// same record started after it; the closing refetch still reconciles.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    latest: Arc<DashMap<RecordId, u64>>,
    next: Arc<AtomicU64>,
}

impl Sequencer {
    /// Start a mutation on `id`
    pub fn begin(&self, id: &RecordId) -> u64 {
        let seq = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.insert(id.clone(), seq);
        seq
    }

    /// Whether `seq` is still the newest mutation on `id`
    #[must_use]
    pub fn is_latest(&self, id: &RecordId, seq: u64) -> bool {
        self.latest.get(id).is_some_and(|latest| *latest == seq)
    }

    /// Forget `id` if `seq` is still its newest mutation
    pub fn end(&self, id: &RecordId, seq: u64) {
        self.latest.remove_if(id, |_, latest| *latest == seq);
    }
}

/// Replace the placeholder with the created record, keeping exactly one
/// record with the server id
fn reconcile_created<E: Entity>(mut items: Vec<E>, placeholder: &RecordId, created: E) -> Vec<E> {
    if items.iter().any(|item| item.id() == created.id()) {
        items.retain(|item| item.id() != placeholder);
        return items;
    }
    match items.iter().position(|item| item.id() == placeholder) {
        Some(index) => items[index] = created,
        None => items.push(created),
    }
    items
}

fn replace_by_id<E: Entity>(mut items: Vec<E>, record: &E) -> Vec<E> {
    if let Some(item) = items.iter_mut().find(|item| item.id() == record.id()) {
        *item = record.clone();
    }
    items
}

/// Create, update and delete for one entity collection
pub struct CollectionMutator<E: Entity> {
    runner: MutationRunner,
    accessor: RemoteAccessor<E>,
    key: QueryKey,
    dependents: Vec<QueryKey>,
    sequencer: Sequencer,
}

impl<E: Entity> CollectionMutator<E> {
    /// Mutator for `E` over `runner` and `accessor`
    #[must_use]
    pub fn new(runner: MutationRunner, accessor: RemoteAccessor<E>) -> Self {
        Self {
            runner,
            accessor,
            key: crate::keys::collection::<E>(),
            dependents: Vec::new(),
            sequencer: Sequencer::default(),
        }
    }

    /// Also invalidate `key` after every mutation
    #[must_use]
    pub fn with_dependent(mut self, key: QueryKey) -> Self {
        self.dependents.push(key);
        self
    }

    /// Cache key of the collection
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Remote accessor for `E`
    #[must_use]
    pub fn accessor(&self) -> &RemoteAccessor<E> {
        &self.accessor
    }

    /// Per-record sequence numbers
    #[must_use]
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Cached record with `id`
    #[must_use]
    pub fn cached(&self, id: &RecordId) -> Option<E> {
        self.runner
            .cache()
            .get_data::<Vec<E>>(&self.key)?
            .into_iter()
            .find(|item| item.id() == id)
    }

    fn stage_common(&self, ctx: &mut OptimisticContext<'_>) {
        ctx.persist::<Vec<E>>(&self.key, E::KIND.collection());
        for key in &self.dependents {
            ctx.invalidate(key.clone());
        }
    }

    /// Append a placeholder record, then swap it for the server's record
    ///
    /// # Errors
    /// `RemoteOperationFailed` after rollback
    pub async fn create(&self, draft: E::Draft) -> SlateResult<E> {
        let placeholder = RecordId::placeholder();
        let optimistic = E::from_draft(placeholder.clone(), &draft);
        let label = format!("create {}", E::KIND);

        self.runner
            .run(
                &label,
                |ctx| {
                    ctx.insert_record(&self.key, optimistic);
                    self.stage_common(ctx);
                },
                || self.accessor.create(&draft),
                |cache, created: &E| {
                    cache.update_data::<Vec<E>, _>(&self.key, |items| {
                        items.map(|items| reconcile_created(items, &placeholder, created.clone()))
                    });
                },
            )
            .await
    }

    /// Patch the cached record, then write back the server's record
    ///
    /// # Errors
    /// `RemoteOperationFailed` after rollback
    pub async fn update(&self, id: &RecordId, patch: E::Patch) -> SlateResult<E> {
        let seq = self.sequencer.begin(id);
        let label = format!("update {}", E::KIND);

        let result = self
            .runner
            .run(
                &label,
                |ctx| {
                    ctx.edit_record::<E, _>(&self.key, id, |item| item.apply_patch(&patch));
                    self.stage_common(ctx);
                },
                || self.accessor.update(id, &patch),
                |cache, updated: &E| {
                    if self.sequencer.is_latest(id, seq) {
                        cache.update_data::<Vec<E>, _>(&self.key, |items| {
                            items.map(|items| replace_by_id(items, updated))
                        });
                    } else {
                        debug!(%id, seq, "newer mutation started, dropping stale response");
                    }
                },
            )
            .await;

        self.sequencer.end(id, seq);
        result
    }

    /// Remove the record from the cache, then from the server
    ///
    /// # Errors
    /// `RemoteOperationFailed` after rollback
    pub async fn delete(&self, id: &RecordId) -> SlateResult<()> {
        let seq = self.sequencer.begin(id);
        let label = format!("delete {}", E::KIND);

        let result = self
            .runner
            .run(
                &label,
                |ctx| {
                    ctx.remove_record::<E>(&self.key, id);
                    self.stage_common(ctx);
                },
                || self.accessor.delete(id),
                |_, _| {},
            )
            .await;

        self.sequencer.end(id, seq);
        result
    }
}

impl<E: Entity> Clone for CollectionMutator<E> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            accessor: self.accessor.clone(),
            key: self.key.clone(),
            dependents: self.dependents.clone(),
            sequencer: self.sequencer.clone(),
        }
    }
}

impl<E: Entity> fmt::Debug for CollectionMutator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionMutator")
            .field("key", &self.key)
            .field("dependents", &self.dependents)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NoticeLevel, RecordingNotifier};
    use pretty_assertions::assert_eq;
    use slate_core::{RemoteError, Rule, RuleDraft, RulePatch};
    use slate_remote::{MemoryBackend, Table};
    use std::time::Duration;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        cache: QueryCache,
        notifier: RecordingNotifier,
        rules: CollectionMutator<Rule>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let cache = QueryCache::default();
        let notifier = RecordingNotifier::new();
        let runner = MutationRunner::new(cache.clone(), Arc::new(notifier.clone()));
        let rules = CollectionMutator::new(runner, RemoteAccessor::new(backend.clone()));
        cache.set_data(rules.key(), Vec::<Rule>::new());
        Fixture {
            backend,
            cache,
            notifier,
            rules,
        }
    }

    #[tokio::test]
    async fn create_swaps_placeholder_for_server_id() {
        let fx = fixture();
        let created = fx.rules.create(RuleDraft::new("Bedtime")).await.unwrap();

        let cached: Vec<Rule> = fx.cache.get_data(fx.rules.key()).unwrap();
        assert_eq!(cached, vec![created.clone()]);
        assert!(!created.id.is_placeholder());
        assert!(cached.iter().all(|rule| !rule.id.is_placeholder()));
    }

    #[tokio::test]
    async fn failed_create_removes_placeholder_and_notifies() {
        let fx = fixture();
        let before: Vec<Rule> = fx.cache.get_data(fx.rules.key()).unwrap();
        fx.backend.fail_next(RemoteError::network("reset"));

        let err = fx.rules.create(RuleDraft::new("Bedtime")).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(fx.cache.get_data::<Vec<Rule>>(fx.rules.key()).unwrap(), before);
        assert_eq!(fx.notifier.with_level(NoticeLevel::Error).len(), 1);
        assert!(fx.cache.is_stale(fx.rules.key()));
    }

    #[tokio::test]
    async fn update_and_delete_round_trip() {
        let fx = fixture();
        let created = fx.rules.create(RuleDraft::new("Bedtime")).await.unwrap();
        let patch = RulePatch {
            title: Some("Lights out".into()),
            ..RulePatch::default()
        };

        let updated = fx.rules.update(&created.id, patch).await.unwrap();
        assert_eq!(updated.title, "Lights out");
        assert_eq!(fx.rules.cached(&created.id).unwrap().title, "Lights out");

        fx.rules.delete(&created.id).await.unwrap();
        assert!(fx.rules.cached(&created.id).is_none());
        assert!(fx.backend.rows(Table::Rules).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_update_response_is_dropped() {
        let fx = fixture();
        let created = fx.rules.create(RuleDraft::new("Bedtime")).await.unwrap();
        fx.backend.set_latency(Duration::from_millis(100));

        let first = RulePatch {
            title: Some("first".into()),
            ..RulePatch::default()
        };
        let second = RulePatch {
            title: Some("second".into()),
            ..RulePatch::default()
        };

        let slow = fx.rules.update(&created.id, first);
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fx.backend.set_latency(Duration::from_millis(5));
            fx.rules.update(&created.id, second).await
        };
        let (slow, fast) = tokio::join!(slow, fast);
        slow.unwrap();
        fast.unwrap();

        assert_eq!(fx.rules.cached(&created.id).unwrap().title, "second");
    }

    #[tokio::test]
    async fn failed_delete_puts_record_back_in_place() {
        let fx = fixture();
        let a = fx.rules.create(RuleDraft::new("a")).await.unwrap();
        let b = fx.rules.create(RuleDraft::new("b")).await.unwrap();
        fx.backend.fail_next(RemoteError::network("reset"));

        assert!(fx.rules.delete(&a.id).await.is_err());

        assert_eq!(fx.cache.get_data::<Vec<Rule>>(fx.rules.key()).unwrap(), vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_keeps_record_created_meanwhile() {
        let fx = fixture();
        let original = fx.rules.create(RuleDraft::new("Bedtime")).await.unwrap();
        fx.backend.set_latency(Duration::from_millis(50));
        fx.backend.fail_writes_every(2);

        let rename = RulePatch {
            title: Some("Lights out".into()),
            ..RulePatch::default()
        };
        let slow = fx.rules.update(&original.id, rename);
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fx.backend.set_latency(Duration::from_millis(5));
            fx.rules.create(RuleDraft::new("Chores")).await
        };
        let (updated, created) = tokio::join!(slow, fast);

        assert!(updated.is_err());
        let created = created.unwrap();
        assert_eq!(
            fx.cache.get_data::<Vec<Rule>>(fx.rules.key()).unwrap(),
            vec![original, created]
        );
    }

    #[test]
    fn reconcile_never_duplicates_server_record() {
        let placeholder = RecordId::placeholder();
        let server = Rule::from_draft(RecordId::new("r1"), &RuleDraft::new("a"));
        let items = vec![
            Rule::from_draft(placeholder.clone(), &RuleDraft::new("a")),
            server.clone(),
        ];

        let out = reconcile_created(items, &placeholder, server.clone());
        assert_eq!(out, vec![server]);
    }

    #[test]
    fn sequencer_tracks_latest() {
        let sequencer = Sequencer::default();
        let id = RecordId::new("r1");
        let a = sequencer.begin(&id);
        let b = sequencer.begin(&id);

        assert!(!sequencer.is_latest(&id, a));
        sequencer.end(&id, a);
        assert!(sequencer.is_latest(&id, b));
        sequencer.end(&id, b);
        assert!(!sequencer.is_latest(&id, b));
    }
}
