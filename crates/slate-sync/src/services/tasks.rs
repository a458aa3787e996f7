use super::{edit_record, write_back, ServiceContext};
use crate::compensation::WriteChain;
use crate::keys;
use crate::mutation::CollectionMutator;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use slate_core::{
    PointsBalance, RecordId, SlateResult, Task, TaskCompletion, TaskPatch, UsageData, ValidationError,
};
use slate_remote::{AdjustPointsArgs, PushKind};

/// Tasks: CRUD plus completion
#[derive(Debug, Clone)]
pub struct TaskService {
    context: ServiceContext,
    tasks: CollectionMutator<Task>,
}

impl TaskService {
    /// Service over `context`
    #[must_use]
    pub fn new(context: ServiceContext) -> Self {
        let user = context.user().clone();
        let tasks = context
            .mutator::<Task>()
            .with_dependent(keys::completion_history(&user));
        Self { context, tasks }
    }

    /// Create, update and delete
    #[must_use]
    pub fn collection(&self) -> &CollectionMutator<Task> {
        &self.tasks
    }

    /// Complete task `id` today
    ///
    /// # Errors
    /// `ValidationFailed` when the task is unknown or its quota for the
    /// period is used up; `RemoteOperationFailed` after rollback
    pub async fn complete(&self, id: &RecordId) -> SlateResult<Task> {
        self.complete_on(id, Utc::now().date_naive()).await
    }

    /// Complete task `id` on `today`
    ///
    /// # Errors
    /// Same as [`complete`](Self::complete)
    pub async fn complete_on(&self, id: &RecordId, today: NaiveDate) -> SlateResult<Task> {
        const LABEL: &str = "complete task";
        let context = &self.context;
        let runner = context.runner();

        let task = match context.find::<Task>(id) {
            Ok(task) => task,
            Err(error) => return runner.reject(LABEL, error),
        };
        if !task.can_complete(today) {
            return runner.reject(
                LABEL,
                ValidationError::FrequencyExhausted {
                    title: task.title.clone(),
                },
            );
        }

        let mut usage_data = task.usage_data;
        usage_data.increment(UsageData::day_index(today));
        let mut completed = task.clone();
        completed.usage_data = usage_data;
        completed.last_completed_date = Some(today);
        completed.completed = !completed.can_complete(today);

        let patch = TaskPatch {
            usage_data: Some(usage_data),
            completed: Some(completed.completed),
            last_completed_date: Some(today),
            ..TaskPatch::default()
        };
        let user = context.user();
        let points = task.points;

        let (updated, _) = runner
            .run(
                LABEL,
                |ctx| {
                    edit_record::<Task, _>(ctx, id, |item| *item = completed.clone());
                    context.credit(ctx, points, 0);
                    ctx.invalidate(keys::completion_history(user));
                    ctx.invalidate(keys::ledger(user));
                },
                move || async move {
                    // The balance moves first; the task and history writes
                    // that follow are taken back if either fails
                    let mut chain = WriteChain::new(LABEL);
                    let profiles = context.profiles();
                    let balance = chain
                        .write(profiles.adjust_points(&AdjustPointsArgs::new(user.clone(), points, 0)))
                        .await?;
                    chain.landed("refund points", async move {
                        let refund = AdjustPointsArgs::new(user.clone(), -points, 0).allowing_negative();
                        profiles.adjust_points(&refund).await
                    });
                    let accessor = self.tasks.accessor();
                    let updated = chain.write(accessor.update(id, &patch)).await?;
                    chain.landed("restore task", async move { accessor.restore(&task).await });
                    chain
                        .write(
                            context
                                .ledger()
                                .record_completion(&TaskCompletion::now(id.clone(), user.clone(), points)),
                        )
                        .await?;
                    Ok::<(Task, PointsBalance), slate_core::SlateError>((updated, balance))
                },
                |cache, (updated, balance): &(Task, PointsBalance)| {
                    write_back(cache, updated);
                    context.settle_balance(cache, *balance);
                },
            )
            .await?;

        context
            .push()
            .send(
                PushKind::TaskCompleted,
                "Task completed",
                format!("{} (+{points})", updated.title),
                json!({ "task_id": updated.id, "points": points }),
            )
            .await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationRunner;
    use crate::notify::{NoticeLevel, RecordingNotifier};
    use crate::services::PartnerPush;
    use pretty_assertions::assert_eq;
    use slate_core::{Entity, Profile, RemoteError, Role, TaskDraft, UserId};
    use slate_cache::QueryCache;
    use slate_remote::{MemoryBackend, Operation, Table};
    use std::sync::Arc;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        cache: QueryCache,
        notifier: RecordingNotifier,
        service: TaskService,
        user: UserId,
        task: Task,
    }

    // 2026-03-02 is a Monday
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn fixture(profile_points: i64) -> Fixture {
        let user = UserId::new("sub");
        let backend = Arc::new(MemoryBackend::new());
        let mut profile = Profile::new(user.clone(), Role::Submissive);
        profile.points = profile_points;
        backend
            .seed(Table::Profiles, serde_json::to_value(&profile).unwrap())
            .unwrap();
        let task = Task::from_draft(RecordId::new("t1"), &TaskDraft::new("Dishes", 5));
        backend.seed(Table::Tasks, serde_json::to_value(&task).unwrap()).unwrap();

        let cache = QueryCache::default();
        cache.set_data(&keys::collection::<Task>(), vec![task.clone()]);
        cache.set_data(&keys::points(&user), profile.balance());
        cache.set_data(&keys::profile(&user), profile);

        let notifier = RecordingNotifier::new();
        let runner = MutationRunner::new(cache.clone(), Arc::new(notifier.clone()));
        let context = ServiceContext::new(runner, backend.clone(), user.clone(), PartnerPush::disabled());
        Fixture {
            backend,
            cache,
            notifier,
            service: TaskService::new(context),
            user,
            task,
        }
    }

    fn cached_points(fx: &Fixture) -> i64 {
        fx.cache.get_data::<PointsBalance>(&keys::points(&fx.user)).unwrap().points
    }

    #[tokio::test]
    async fn completion_credits_points_and_records_history() {
        let fx = fixture(10);

        let task = fx.service.complete_on(&fx.task.id, monday()).await.unwrap();

        assert!(task.completed);
        assert_eq!(task.usage_data.get(0), 1);
        assert_eq!(cached_points(&fx), 15);
        assert_eq!(fx.backend.rows(Table::TaskCompletionHistory).len(), 1);
        assert_eq!(fx.backend.row(Table::Profiles, "sub").unwrap()["points"], json!(15));
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_credit_then_rollback_on_failure() {
        let fx = fixture(10);
        fx.backend.set_latency(std::time::Duration::from_millis(50));
        fx.backend.fail_next(RemoteError::network("reset"));
        let before: Vec<Task> = fx.cache.get_data(&keys::collection::<Task>()).unwrap();

        let complete = fx.service.complete_on(&fx.task.id, monday());
        let observe = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cached_points(&fx)
        };
        let (result, during) = tokio::join!(complete, observe);

        assert_eq!(during, 15);
        assert!(result.is_err());
        assert_eq!(cached_points(&fx), 10);
        assert_eq!(fx.cache.get_data::<Vec<Task>>(&keys::collection::<Task>()).unwrap(), before);
        assert_eq!(fx.notifier.with_level(NoticeLevel::Error).len(), 1);
    }

    #[tokio::test]
    async fn exhausted_quota_is_rejected_without_network() {
        let fx = fixture(10);
        fx.service.complete_on(&fx.task.id, monday()).await.unwrap();
        fx.backend.reset_calls();

        let err = fx.service.complete_on(&fx.task.id, monday()).await.unwrap_err();

        assert!(err.is_validation());
        assert_eq!(fx.backend.total_calls(), 0);
        assert_eq!(fx.backend.calls(Operation::Rpc), 0);
    }

    async fn assert_later_write_failure_leaves_server_untouched(fail_every: u64) {
        let fx = fixture(10);
        fx.backend.fail_writes_every(fail_every);

        let err = fx.service.complete_on(&fx.task.id, monday()).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(fx.backend.row(Table::Profiles, "sub").unwrap()["points"], json!(10));
        let stored: Task = serde_json::from_value(fx.backend.row(Table::Tasks, "t1").unwrap()).unwrap();
        assert_eq!(stored, fx.task);
        assert!(fx.backend.rows(Table::TaskCompletionHistory).is_empty());
        assert_eq!(cached_points(&fx), 10);

        fx.backend.fail_writes_every(0);
        let task = fx.service.complete_on(&fx.task.id, monday()).await.unwrap();
        assert!(task.completed);
        assert_eq!(fx.backend.row(Table::Profiles, "sub").unwrap()["points"], json!(15));
        assert_eq!(fx.backend.rows(Table::TaskCompletionHistory).len(), 1);
    }

    #[tokio::test]
    async fn failed_task_write_refunds_points() {
        assert_later_write_failure_leaves_server_untouched(2).await;
    }

    #[tokio::test]
    async fn failed_history_write_restores_task_and_refunds_points() {
        assert_later_write_failure_leaves_server_untouched(3).await;
    }
}
