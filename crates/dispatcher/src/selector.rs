use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use scheduler_core::{Channel, ScheduleTask, SchedulerResult, TaskStore};
use scheduler_infrastructure::observability::{MetricsCollector, StructuredLogger};

/// 到期任务选择器
///
/// 只是存储层原子领取操作的薄封装：负责批次上限、日志与指标。
/// 并发的选择器之间没有任何应用层锁，互斥完全由存储层的领取语义保证。
pub struct DueTaskSelector {
    store: Arc<dyn TaskStore>,
    batch_size: i64,
    metrics: MetricsCollector,
}

impl DueTaskSelector {
    pub fn new(store: Arc<dyn TaskStore>, batch_size: i64) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// 领取最多 `limit` 个到期任务，`limit` 不超过配置的批次大小
    #[instrument(skip(self), fields(batch_size = self.batch_size))]
    pub async fn claim(
        &self,
        now: DateTime<Utc>,
        channel: Option<Channel>,
        limit: Option<i64>,
    ) -> SchedulerResult<Vec<ScheduleTask>> {
        let limit = limit.unwrap_or(self.batch_size).min(self.batch_size);
        if limit <= 0 {
            debug!("领取数量为0，跳过本次领取");
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let tasks = self.store.claim_due(now, limit, channel).await?;
        self.metrics
            .record_claim("due", tasks.len(), started.elapsed().as_secs_f64());

        if !tasks.is_empty() {
            let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
            StructuredLogger::log_tasks_claimed("due", channel, &ids);
        }
        Ok(tasks)
    }

    /// 手动领取单个任务，忽略到期时间
    #[instrument(skip(self))]
    pub async fn claim_one(
        &self,
        task_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<ScheduleTask>> {
        let started = Instant::now();
        let task = self.store.claim_by_id(task_id, now).await?;
        self.metrics.record_claim(
            "manual",
            usize::from(task.is_some()),
            started.elapsed().as_secs_f64(),
        );

        match &task {
            Some(task) => {
                StructuredLogger::log_tasks_claimed("manual", Some(task.channel()), &[task.id])
            }
            None => debug!(task.id = task_id, "任务正在执行中，跳过手动触发"),
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::ExecutionStatus;
    use scheduler_testing_utils::{MockTaskStore, TaskBuilder};

    #[tokio::test]
    async fn test_claim_caps_limit_to_batch_size() {
        let store = MockTaskStore::new();
        for _ in 0..5 {
            store.insert(TaskBuilder::new().build());
        }
        let selector = DueTaskSelector::new(Arc::new(store.clone()), 3);

        let claimed = selector.claim(Utc::now(), None, Some(10)).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed
            .iter()
            .all(|t| t.execution_status == ExecutionStatus::Processing));

        let claimed = selector.claim(Utc::now(), None, None).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_due_set_performs_no_writes() {
        let store = MockTaskStore::new();
        store.insert(TaskBuilder::new().with_enabled(false).build());
        store.insert(
            TaskBuilder::new()
                .due_in(chrono::Duration::hours(1))
                .build(),
        );
        let selector = DueTaskSelector::new(Arc::new(store.clone()), 10);

        let claimed = selector.claim(Utc::now(), None, None).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.write_count(), 0);

        let claimed = selector.claim(Utc::now(), None, Some(0)).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_claim_one_skips_in_flight_task() {
        let store = MockTaskStore::new();
        let idle = store.insert(TaskBuilder::new().due_in(chrono::Duration::days(1)).build());
        let busy = store.insert(
            TaskBuilder::new()
                .with_status(ExecutionStatus::Processing)
                .build(),
        );
        let selector = DueTaskSelector::new(Arc::new(store), 10);

        let claimed = selector.claim_one(idle.id, Utc::now()).await.unwrap();
        assert_eq!(claimed.map(|t| t.id), Some(idle.id));
        assert!(selector
            .claim_one(busy.id, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(selector.claim_one(9999, Utc::now()).await.is_err());
    }
}
