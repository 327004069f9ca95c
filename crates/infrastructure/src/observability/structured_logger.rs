//! Structured engine events

use chrono::{DateTime, Utc};
use scheduler_core::{Channel, ExecutionStatus};
use tracing::{error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_tasks_claimed(trigger: &str, channel: Option<Channel>, task_ids: &[i64]) {
        info!(
            event = "task_claimed",
            trigger = trigger,
            channel = ?channel,
            claimed = task_ids.len(),
            task_ids = ?task_ids,
            "Tasks claimed for execution"
        );
    }

    pub fn log_execution_completed(
        task_id: i64,
        channel: Channel,
        duration_ms: i64,
        next_execute_time: Option<DateTime<Utc>>,
    ) {
        info!(
            event = "task_execution_completed",
            task.id = task_id,
            task.channel = %channel,
            duration_ms = duration_ms,
            next_execute_time = ?next_execute_time,
            "Task execution completed"
        );
    }

    pub fn log_execution_failed(
        task_id: i64,
        channel: Channel,
        exception_type: &str,
        error_message: &str,
        status: ExecutionStatus,
    ) {
        warn!(
            event = "task_execution_failed",
            task.id = task_id,
            task.channel = %channel,
            exception_type = exception_type,
            error = error_message,
            status = %status,
            "Task execution failed"
        );
    }

    pub fn log_retry_scheduled(
        task_id: i64,
        retry_count: i32,
        max_retries: i32,
        next_execute_time: DateTime<Utc>,
    ) {
        info!(
            event = "task_retry_scheduled",
            task.id = task_id,
            retry_count = retry_count,
            max_retries = max_retries,
            next_execute_time = %next_execute_time,
            "Task retry scheduled"
        );
    }

    pub fn log_commit_failed(task_id: i64, error_message: &str) {
        error!(
            event = "task_commit_failed",
            task.id = task_id,
            error = error_message,
            "Failed to commit execution result, task left in Processing"
        );
    }

    pub fn log_stale_reclaimed(task_ids: &[i64], stale_before: DateTime<Utc>) {
        warn!(
            event = "stale_tasks_reclaimed",
            count = task_ids.len(),
            task_ids = ?task_ids,
            stale_before = %stale_before,
            "Stale Processing tasks returned to Pending"
        );
    }
}
