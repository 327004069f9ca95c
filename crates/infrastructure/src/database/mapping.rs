//! Shared row mapping helpers for the SQLite and PostgreSQL stores

use scheduler_core::{ExceptionContext, SchedulerError, SchedulerResult, TaskPayload};

/// 任务表查询列，两个后端共用
pub const TASK_COLUMNS: &str = "id, name, channel, payload, schedule_cron, is_enabled, \
    execution_status, next_execute_time, last_execute_time, last_success_time, \
    last_error_message, execute_count, success_count, failure_count, current_retry_count, \
    max_retries, retry_interval_seconds, created_at, updated_at";

pub const HISTORY_COLUMNS: &str = "id, task_id, channel, start_time, end_time, duration_ms, \
    is_success, error_message, http_status, response_size, emails_sent, files_transferred, \
    bytes_transferred, execution_details";

pub const EXCEPTION_COLUMNS: &str = "id, task_id, channel, exception_type, exception_message, \
    context, occurred_at, is_resolved, resolved_by, resolved_at, resolve_note";

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn parse_payload_sqlite(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<TaskPayload> {
        use sqlx::Row;
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务配置失败: {e}")))
    }

    pub fn parse_payload_postgres(
        row: &sqlx::postgres::PgRow,
        field_name: &str,
    ) -> SchedulerResult<TaskPayload> {
        use sqlx::Row;
        let value: serde_json::Value = row.try_get(field_name)?;
        serde_json::from_value(value)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务配置失败: {e}")))
    }

    pub fn parse_json_sqlite(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<Option<serde_json::Value>> {
        use sqlx::Row;
        match row.try_get::<Option<String>, _>(field_name)? {
            Some(json_str) => json_str
                .parse()
                .map(Some)
                .map_err(|e| SchedulerError::Serialization(format!("解析执行详情失败: {e}"))),
            None => Ok(None),
        }
    }

    pub fn parse_context_sqlite(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<ExceptionContext> {
        use sqlx::Row;
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析异常上下文失败: {e}")))
    }

    pub fn parse_context_postgres(
        row: &sqlx::postgres::PgRow,
        field_name: &str,
    ) -> SchedulerResult<ExceptionContext> {
        use sqlx::Row;
        let value: serde_json::Value = row.try_get(field_name)?;
        serde_json::from_value(value)
            .map_err(|e| SchedulerError::Serialization(format!("解析异常上下文失败: {e}")))
    }
}
