//! Sync simulator
//!
//! Drives a [`SlateClient`] against the in-memory backend with a seeded
//! random workload while every n-th write fails, and checks after each
//! operation that the cache is in a state the user could trust:
//! - a failed mutation left its collection and the balance untouched, in
//!   the cache and on the server
//! - a rejected mutation issued no writes
//! - a confirmed mutation left no placeholder ids and a balance equal to
//!   the server's

use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use slate_cache::{MirrorStore, QueryCache};
use slate_core::{
    Entity, EntityKind, PointsBalance, Profile, Punishment, PunishmentDraft, RecordId, Reward,
    RewardDraft, Role, Rule, RuleDraft, SlateError, SlateResult, Task, TaskDraft, TaskPatch,
    UserId,
};
use slate_remote::{MemoryBackend, Operation, ProfileAccessor, Table};
use slate_sync::{keys, RecordingNotifier, SlateClient};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SUBMISSIVE: &str = "sim-sub";
const DOMINANT: &str = "sim-dom";
const STARTING_POINTS: i64 = 50;
const QUIESCE_ROUNDS: usize = 64;

const WRITES: [Operation; 6] = [
    Operation::Insert,
    Operation::Update,
    Operation::Delete,
    Operation::Upsert,
    Operation::Rpc,
    Operation::Invoke,
];

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Seed for operation and target choice
    pub seed: u64,
    /// Operations to run
    pub operations: u64,
    /// Fail every n-th backend write; `0` disables
    pub fail_every: u64,
    /// Tasks in the starting data set
    pub seed_tasks: usize,
    /// Stop at the first failed check
    pub stop_on_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            operations: 200,
            fail_every: 5,
            seed_tasks: 8,
            stop_on_violation: false,
        }
    }
}

/// One step of the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedOperation {
    /// Complete a cached task
    CompleteTask,
    /// Create a task
    CreateTask,
    /// Rename a cached task
    RenameTask,
    /// Delete a cached task
    DeleteTask,
    /// Buy a cached reward
    BuyReward,
    /// Redeem a cached reward
    RedeemReward,
    /// Apply a cached punishment
    ApplyPunishment,
    /// Record a violation of a cached rule
    RecordViolation,
    /// Create a rule
    CreateRule,
}

impl SimulatedOperation {
    const ALL: [SimulatedOperation; 9] = [
        SimulatedOperation::CompleteTask,
        SimulatedOperation::CreateTask,
        SimulatedOperation::RenameTask,
        SimulatedOperation::DeleteTask,
        SimulatedOperation::BuyReward,
        SimulatedOperation::RedeemReward,
        SimulatedOperation::ApplyPunishment,
        SimulatedOperation::RecordViolation,
        SimulatedOperation::CreateRule,
    ];

    /// Collection the operation edits
    fn kind(self) -> EntityKind {
        match self {
            Self::CompleteTask | Self::CreateTask | Self::RenameTask | Self::DeleteTask => {
                EntityKind::Task
            }
            Self::BuyReward | Self::RedeemReward => EntityKind::Reward,
            Self::ApplyPunishment => EntityKind::Punishment,
            Self::RecordViolation | Self::CreateRule => EntityKind::Rule,
        }
    }
}

/// A check that failed after an operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Failed mutation left its collection changed
    CollectionNotRestored {
        /// Zero-based step index
        step: u64,
        /// Operation that ran
        operation: SimulatedOperation,
        /// Collection checked
        collection: &'static str,
    },
    /// Failed mutation left the balance changed
    BalanceNotRestored {
        /// Zero-based step index
        step: u64,
        /// Operation that ran
        operation: SimulatedOperation,
        /// Value before the operation
        before: Option<PointsBalance>,
        /// Value after the operation
        after: Option<PointsBalance>,
    },
    /// Failed mutation left the server's balance changed
    ServerBalanceDrifted {
        /// Zero-based step index
        step: u64,
        /// Operation that ran
        operation: SimulatedOperation,
        /// Value before the operation
        before: PointsBalance,
        /// Value after the operation
        after: PointsBalance,
    },
    /// Rejected mutation still wrote to the backend
    RejectedButWrote {
        /// Zero-based step index
        step: u64,
        /// Operation that ran
        operation: SimulatedOperation,
        /// Writes issued
        writes: u64,
    },
    /// Confirmed mutation left a placeholder id behind
    PlaceholderLeft {
        /// Zero-based step index
        step: u64,
        /// Operation that ran
        operation: SimulatedOperation,
        /// Collection checked
        collection: &'static str,
    },
    /// Cached balance disagrees with the server after a confirmed mutation
    BalanceDiverged {
        /// Zero-based step index
        step: u64,
        /// Operation that ran
        operation: SimulatedOperation,
        /// Cached balance
        cached: Option<PointsBalance>,
        /// Server balance
        server: PointsBalance,
    },
}

/// Outcome counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    /// Operations that found a target
    pub operations_attempted: u64,
    /// Confirmed by the server
    pub confirmed: u64,
    /// Failed and rolled back
    pub rolled_back: u64,
    /// Rejected by a precondition
    pub rejected: u64,
    /// Nothing to act on, e.g. deleting from an empty collection
    pub skipped: u64,
    /// Notices shown over the run
    pub notices: usize,
}

/// Final report from the simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Settings of the run
    pub config: SimulatorConfig,
    /// Outcome counts
    pub stats: SimulatorStats,
    /// Failed checks, in order
    pub violations: Vec<Violation>,
    /// Cached balance at the end
    pub final_balance: Option<PointsBalance>,
}

impl SimulatorReport {
    /// Whether every check held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let stats = &self.stats;

        let _ = writeln!(report, "=== Navy Slate Sync Simulator ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Fail Every N-th Write: {}", self.config.fail_every);
        let _ = writeln!(report, "Operations Attempted: {}", stats.operations_attempted);
        let _ = writeln!(report, "Confirmed: {}", stats.confirmed);
        let _ = writeln!(report, "Rolled Back: {}", stats.rolled_back);
        let _ = writeln!(report, "Rejected: {}", stats.rejected);
        let _ = writeln!(report, "Skipped: {}", stats.skipped);
        let _ = writeln!(report, "Notices Shown: {}", stats.notices);
        if let Some(balance) = self.final_balance {
            let _ = writeln!(
                report,
                "Final Balance: {} points, {} dom points",
                balance.points, balance.dom_points
            );
        }
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, violation) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {violation:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Run the simulator
///
/// # Errors
/// Setup failures: seeding the backend or loading the starting profile
pub async fn run_simulator(config: SimulatorConfig) -> anyhow::Result<SimulatorReport> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let backend = Arc::new(MemoryBackend::new());
    seed_world(&backend, &mut rng, config.seed_tasks).context("seeding backend")?;

    let notifier = RecordingNotifier::new();
    let user = UserId::new(SUBMISSIVE);
    let client = SlateClient::builder(user.clone(), backend.clone())
        .mirror(MirrorStore::in_memory(Duration::from_secs(3600)))
        .notifier(Arc::new(notifier.clone()))
        .build();
    client.hydrate().await;
    client.refresh_profile().await.context("loading profile")?;
    backend.fail_writes_every(config.fail_every);

    let profiles = ProfileAccessor::new(backend.clone());
    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();
    info!(seed = config.seed, operations = config.operations, fail_every = config.fail_every, "simulation started");

    for step in 0..config.operations {
        quiesce(client.cache()).await;
        let Some(&operation) = SimulatedOperation::ALL.choose(&mut rng) else {
            break;
        };
        let kind = operation.kind();
        let collection_before = collection_bytes(&client, kind);
        let balance_before = cached_balance(&client);
        let server_before = profiles.fetch_balance(&user).await?;
        let writes_before = writes(&backend);

        let Some(result) = execute(&client, operation, &mut rng, step).await else {
            stats.skipped += 1;
            continue;
        };
        stats.operations_attempted += 1;
        let found = violations.len();

        match result {
            Ok(()) => {
                stats.confirmed += 1;
                if collection_has_placeholder(&client, kind) {
                    violations.push(Violation::PlaceholderLeft {
                        step,
                        operation,
                        collection: kind.collection(),
                    });
                }
                let server = profiles.fetch_balance(&user).await?;
                let cached = cached_balance(&client);
                if cached != Some(server) {
                    violations.push(Violation::BalanceDiverged {
                        step,
                        operation,
                        cached,
                        server,
                    });
                }
            }
            Err(SlateError::ValidationFailed(reason)) => {
                stats.rejected += 1;
                debug!(step, ?operation, %reason, "rejected");
                let writes = writes(&backend) - writes_before;
                if writes > 0 {
                    violations.push(Violation::RejectedButWrote {
                        step,
                        operation,
                        writes,
                    });
                }
            }
            Err(error) => {
                stats.rolled_back += 1;
                debug!(step, ?operation, %error, "rolled back");
                if collection_bytes(&client, kind) != collection_before {
                    violations.push(Violation::CollectionNotRestored {
                        step,
                        operation,
                        collection: kind.collection(),
                    });
                }
                let after = cached_balance(&client);
                if after != balance_before {
                    violations.push(Violation::BalanceNotRestored {
                        step,
                        operation,
                        before: balance_before,
                        after,
                    });
                }
                let server_after = profiles.fetch_balance(&user).await?;
                if server_after != server_before {
                    violations.push(Violation::ServerBalanceDrifted {
                        step,
                        operation,
                        before: server_before,
                        after: server_after,
                    });
                }
            }
        }

        if config.stop_on_violation && violations.len() > found {
            break;
        }
    }

    quiesce(client.cache()).await;
    stats.notices = notifier.notices().len();
    info!(
        confirmed = stats.confirmed,
        rolled_back = stats.rolled_back,
        rejected = stats.rejected,
        violations = violations.len(),
        "simulation finished"
    );

    Ok(SimulatorReport {
        final_balance: cached_balance(&client),
        config,
        stats,
        violations,
    })
}

/// Run one operation; `None` when it had no target
async fn execute(
    client: &SlateClient,
    operation: SimulatedOperation,
    rng: &mut StdRng,
    step: u64,
) -> Option<SlateResult<()>> {
    let result = match operation {
        SimulatedOperation::CompleteTask => {
            let id = pick::<Task>(client, rng)?;
            client.tasks().complete(&id).await.map(drop)
        }
        SimulatedOperation::CreateTask => {
            let draft = TaskDraft::new(format!("task {step}"), rng.gen_range(1..=10));
            client.tasks().collection().create(draft).await.map(drop)
        }
        SimulatedOperation::RenameTask => {
            let id = pick::<Task>(client, rng)?;
            let patch = TaskPatch {
                title: Some(format!("renamed at {step}")),
                ..TaskPatch::default()
            };
            client.tasks().collection().update(&id, patch).await.map(drop)
        }
        SimulatedOperation::DeleteTask => {
            let id = pick::<Task>(client, rng)?;
            client.tasks().collection().delete(&id).await
        }
        SimulatedOperation::BuyReward => {
            let id = pick::<Reward>(client, rng)?;
            client.rewards().buy(&id).await.map(drop)
        }
        SimulatedOperation::RedeemReward => {
            let id = pick::<Reward>(client, rng)?;
            client.rewards().redeem(&id).await.map(drop)
        }
        SimulatedOperation::ApplyPunishment => {
            let id = pick::<Punishment>(client, rng)?;
            client.punishments().apply(&id).await.map(drop)
        }
        SimulatedOperation::RecordViolation => {
            let id = pick::<Rule>(client, rng)?;
            client.rules().record_violation(&id).await.map(drop)
        }
        SimulatedOperation::CreateRule => {
            let draft = RuleDraft::new(format!("rule {step}"));
            client.rules().collection().create(draft).await.map(drop)
        }
    };
    Some(result)
}

fn seed_world(backend: &MemoryBackend, rng: &mut StdRng, tasks: usize) -> anyhow::Result<()> {
    let mut me = Profile::new(UserId::new(SUBMISSIVE), Role::Submissive);
    me.points = STARTING_POINTS;
    me.linked_partner_id = Some(UserId::new(DOMINANT));
    let mut partner = Profile::new(UserId::new(DOMINANT), Role::Dominant);
    partner.linked_partner_id = Some(UserId::new(SUBMISSIVE));
    backend.seed(Table::Profiles, serde_json::to_value(&me)?)?;
    backend.seed(Table::Profiles, serde_json::to_value(&partner)?)?;

    for i in 0..tasks {
        let draft = TaskDraft::new(format!("chore {i}"), rng.gen_range(1..=10));
        seed(backend, &Task::from_draft(RecordId::new(format!("task-{i}")), &draft))?;
    }
    for i in 0..3 {
        let draft = RuleDraft::new(format!("rule {i}"));
        seed(backend, &Rule::from_draft(RecordId::new(format!("rule-{i}")), &draft))?;
    }
    for i in 0..3 {
        let mut draft = RewardDraft::new(format!("reward {i}"), rng.gen_range(5..=40));
        draft.supply = rng.gen_range(0..=2);
        seed(backend, &Reward::from_draft(RecordId::new(format!("reward-{i}")), &draft))?;
    }
    for i in 0..2 {
        let draft = PunishmentDraft::new(format!("punishment {i}"), rng.gen_range(2..=10));
        seed(backend, &Punishment::from_draft(RecordId::new(format!("punishment-{i}")), &draft))?;
    }
    Ok(())
}

fn seed<E: Entity>(backend: &MemoryBackend, entity: &E) -> anyhow::Result<()> {
    backend.seed(Table::for_kind(E::KIND), serde_json::to_value(entity)?)?;
    Ok(())
}

/// Wait for background refetches to land
async fn quiesce(cache: &QueryCache) {
    for _ in 0..QUIESCE_ROUNDS {
        if cache.keys().iter().all(|key| !cache.is_fetching(key)) {
            return;
        }
        tokio::task::yield_now().await;
    }
}

fn writes(backend: &MemoryBackend) -> u64 {
    WRITES.iter().map(|operation| backend.calls(*operation)).sum()
}

fn cached<E: Entity>(client: &SlateClient) -> Vec<E> {
    client
        .cache()
        .get_data(&keys::collection::<E>())
        .unwrap_or_default()
}

fn pick<E: Entity>(client: &SlateClient, rng: &mut StdRng) -> Option<RecordId> {
    cached::<E>(client).choose(rng).map(|item| item.id().clone())
}

fn cached_balance(client: &SlateClient) -> Option<PointsBalance> {
    client.cache().get_data(&keys::points(client.user()))
}

fn bytes_of<E: Entity>(client: &SlateClient) -> Vec<u8> {
    serde_json::to_vec(&cached::<E>(client)).unwrap_or_default()
}

fn collection_bytes(client: &SlateClient, kind: EntityKind) -> Vec<u8> {
    match kind {
        EntityKind::Task => bytes_of::<Task>(client),
        EntityKind::Rule => bytes_of::<Rule>(client),
        EntityKind::Reward => bytes_of::<Reward>(client),
        EntityKind::Punishment => bytes_of::<Punishment>(client),
    }
}

fn has_placeholder<E: Entity>(client: &SlateClient) -> bool {
    cached::<E>(client).iter().any(|item| item.id().is_placeholder())
}

fn collection_has_placeholder(client: &SlateClient, kind: EntityKind) -> bool {
    match kind {
        EntityKind::Task => has_placeholder::<Task>(client),
        EntityKind::Rule => has_placeholder::<Rule>(client),
        EntityKind::Reward => has_placeholder::<Reward>(client),
        EntityKind::Punishment => has_placeholder::<Punishment>(client),
    }
}
