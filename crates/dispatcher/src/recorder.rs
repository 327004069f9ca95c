//! 执行记录器
//!
//! 把一次传输结果折算成任务字段的变更、一条执行历史和（失败时）一条异常记录，
//! 然后通过存储层一次性原子提交。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{instrument, warn};

use scheduler_core::{
    ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord, ExecutionResult, ExecutionStatus,
    ScheduleTask, SchedulerResult, TaskStore,
};
use scheduler_infrastructure::observability::{MetricsCollector, StructuredLogger};

use crate::cron_utils::next_execution_time;
use crate::retry_service::{RetryCoordinator, RetryDecision};

pub struct ExecutionRecorder {
    store: Arc<dyn TaskStore>,
    retry: RetryCoordinator,
    metrics: MetricsCollector,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn TaskStore>, retry: RetryCoordinator) -> Self {
        Self {
            store,
            retry,
            metrics: MetricsCollector::new(),
        }
    }

    /// 计算需要提交的全部变更，不访问存储
    ///
    /// CRON的基准时间是执行结束时间，保证下一次时间晚于本次记录。
    pub fn plan(
        &self,
        task: &ScheduleTask,
        result: &ExecutionResult,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> (ExecutionCommit, Option<RetryDecision>) {
        let history = ExecutionHistoryRecord::from_result(task, result, start_time, end_time);
        let cron_next = self.cron_next(task, end_time);

        if result.success {
            let commit = ExecutionCommit {
                task_id: task.id,
                claimed_at: task.last_execute_time,
                success: true,
                execution_status: ExecutionStatus::Completed,
                next_execute_time: cron_next,
                current_retry_count: 0,
                last_success_time: Some(end_time),
                last_error_message: None,
                recorded_at: end_time,
                history,
                exception: None,
            };
            return (commit, None);
        }

        let decision = self.retry.decide(task, end_time, cron_next);
        let (execution_status, current_retry_count) = match decision {
            RetryDecision::Retry { attempt, .. } => (ExecutionStatus::Pending, attempt),
            RetryDecision::Exhausted { max_retries, .. } => (
                ExecutionStatus::Failed,
                task.current_retry_count.min(max_retries).max(0),
            ),
        };

        let commit = ExecutionCommit {
            task_id: task.id,
            claimed_at: task.last_execute_time,
            success: false,
            execution_status,
            next_execute_time: decision.next_execute_time(),
            current_retry_count,
            last_success_time: None,
            last_error_message: Some(
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "未知错误".to_string()),
            ),
            recorded_at: end_time,
            history,
            exception: Some(ExceptionRecord::from_failure(task, result, end_time)),
        };
        (commit, Some(decision))
    }

    /// 提交执行结果，返回已提交的变更
    #[instrument(skip(self, task, result), fields(task.id = task.id, success = result.success))]
    pub async fn record(
        &self,
        task: &ScheduleTask,
        result: &ExecutionResult,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> SchedulerResult<ExecutionCommit> {
        let (commit, decision) = self.plan(task, result, start_time, end_time);

        if let Err(e) = self.store.commit_execution(&commit).await {
            self.metrics.record_commit_failure();
            StructuredLogger::log_commit_failed(task.id, &e.to_string());
            return Err(e);
        }

        let channel = task.channel();
        if result.success {
            StructuredLogger::log_execution_completed(
                task.id,
                channel,
                commit.history.duration_ms,
                commit.next_execute_time,
            );
        } else {
            StructuredLogger::log_execution_failed(
                task.id,
                channel,
                result.exception_type.as_deref().unwrap_or("TransportError"),
                commit.last_error_message.as_deref().unwrap_or_default(),
                commit.execution_status,
            );
            if let Some(RetryDecision::Retry {
                attempt,
                max_retries,
                next_execute_time,
            }) = decision
            {
                self.metrics.record_retry_scheduled(channel);
                StructuredLogger::log_retry_scheduled(
                    task.id,
                    attempt,
                    max_retries,
                    next_execute_time,
                );
            }
        }

        Ok(commit)
    }

    fn cron_next(&self, task: &ScheduleTask, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let expr = task.schedule_cron.as_deref()?;
        match next_execution_time(expr, base) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(
                    task.id = task.id,
                    cron = expr,
                    error = %e,
                    "CRON表达式无效，停止后续调度"
                );
                None
            }
        }
    }
}
