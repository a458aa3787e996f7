//! Navy Slate Sync
//!
//! Keeps a client's cached view of tasks, rules, rewards, punishments and
//! points consistent with the hosted backend:
//! - [`MutationRunner`] and [`CollectionMutator`]: optimistic edits with
//!   per-record rollback
//! - [`WriteChain`]: compensating writes for mutations that touch several rows
//! - Entity services with their preconditions and partner pushes
//! - [`Hydrator`]: warm starts from the local mirror
//! - [`SyncManager`]: timer, realtime and reconnect driven reconciliation
//! - [`SlateClient`]: everything wired together for one user
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slate_core::{RecordId, UserId};
//! use slate_remote::MemoryBackend;
//! use slate_sync::SlateClient;
//!
//! # async fn run() -> slate_core::SlateResult<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let client = SlateClient::builder(UserId::new("sub"), backend.clone()).build();
//!
//! client.hydrate().await;
//! let handle = client.start_sync(Some(backend.subscribe_changes()));
//! client.tasks().complete(&RecordId::new("t1")).await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod client;
pub mod compensation;
pub mod connectivity;
pub mod hydrate;
pub mod keys;
pub mod mutation;
pub mod notify;
pub mod services;
pub mod sync_manager;

pub use client::{Partnership, SlateClient, SlateClientBuilder};
pub use compensation::WriteChain;
pub use connectivity::{Connectivity, PausedMutations};
pub use hydrate::{HydrateOutcome, Hydrator, Source};
pub use mutation::{CollectionMutator, MutationRunner, OptimisticContext, Sequencer};
pub use notify::{Notice, NoticeLevel, Notifier, RecordingNotifier, TracingNotifier};
pub use services::{
    MetricsService, PartnerPush, PunishmentService, RewardService, RuleService, ServiceContext,
    TaskService,
};
pub use sync_manager::{SyncHandle, SyncManager, SyncOutcome, SyncStats};
