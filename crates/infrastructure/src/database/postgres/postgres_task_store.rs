use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{
    traits::TaskStore, Channel, ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord,
    ScheduleTask, SchedulerError, SchedulerResult, TaskFilter,
};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use crate::database::mapping::{
    MappingHelpers, EXCEPTION_COLUMNS, HISTORY_COLUMNS, TASK_COLUMNS,
};
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, TaskOperationContext};
use crate::task_context;

/// PostgreSQL任务存储
///
/// 领取使用 `FOR UPDATE SKIP LOCKED`：被其他事务锁定的行直接跳过，不排队等待。
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 运行数据库迁移
    pub async fn run_migrations(&self) -> SchedulerResult<()> {
        debug!("Running PostgreSQL database migrations");
        let context = task_context!(RepositoryOperation::Migrate);

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS schedule_tasks (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                channel VARCHAR(10) NOT NULL,
                payload JSONB NOT NULL,
                schedule_cron VARCHAR(255),
                is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                execution_status VARCHAR(20) NOT NULL DEFAULT 'Pending',
                next_execute_time TIMESTAMPTZ,
                last_execute_time TIMESTAMPTZ,
                last_success_time TIMESTAMPTZ,
                last_error_message TEXT,
                execute_count BIGINT NOT NULL DEFAULT 0,
                success_count BIGINT NOT NULL DEFAULT 0,
                failure_count BIGINT NOT NULL DEFAULT 0,
                current_retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER,
                retry_interval_seconds BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS schedule_execution_history (
                id BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL,
                channel VARCHAR(10) NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                is_success BOOLEAN NOT NULL,
                error_message TEXT,
                http_status INTEGER,
                response_size BIGINT,
                emails_sent INTEGER,
                files_transferred INTEGER,
                bytes_transferred BIGINT,
                execution_details JSONB
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS schedule_exceptions (
                id BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL,
                channel VARCHAR(10) NOT NULL,
                exception_type VARCHAR(100) NOT NULL,
                exception_message TEXT NOT NULL,
                context JSONB NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
                resolved_by VARCHAR(100),
                resolved_at TIMESTAMPTZ,
                resolve_note TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_schedule_tasks_due ON schedule_tasks(next_execute_time) WHERE is_enabled = TRUE AND execution_status <> 'Processing'",
            "CREATE INDEX IF NOT EXISTS idx_schedule_tasks_channel ON schedule_tasks(channel)",
            "CREATE INDEX IF NOT EXISTS idx_execution_history_task_id ON schedule_execution_history(task_id, start_time DESC)",
            "CREATE INDEX IF NOT EXISTS idx_exceptions_task_id ON schedule_exceptions(task_id, is_resolved)",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;
        }

        Ok(())
    }

    /// 写入新任务，供管理层与测试使用
    #[instrument(skip(self, task), fields(task_name = %task.name))]
    pub async fn insert_task(&self, task: &ScheduleTask) -> SchedulerResult<ScheduleTask> {
        let context = task_context!(RepositoryOperation::Create, channel = Some(task.channel()));
        let payload = serde_json::to_value(&task.payload)
            .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;

        let sql = format!(
            r#"
            INSERT INTO schedule_tasks (
                name, channel, payload, schedule_cron, is_enabled, execution_status,
                next_execute_time, last_execute_time, last_success_time, last_error_message,
                execute_count, success_count, failure_count, current_retry_count,
                max_retries, retry_interval_seconds, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&task.name)
            .bind(task.channel())
            .bind(payload)
            .bind(&task.schedule_cron)
            .bind(task.is_enabled)
            .bind(task.execution_status)
            .bind(task.next_execute_time)
            .bind(task.last_execute_time)
            .bind(task.last_success_time)
            .bind(&task.last_error_message)
            .bind(task.execute_count)
            .bind(task.success_count)
            .bind(task.failure_count)
            .bind(task.current_retry_count)
            .bind(task.max_retries)
            .bind(task.retry_interval_seconds)
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Self::row_to_task(&row)
    }

    fn row_to_task(row: &PgRow) -> SchedulerResult<ScheduleTask> {
        Ok(ScheduleTask {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payload: MappingHelpers::parse_payload_postgres(row, "payload")?,
            schedule_cron: row.try_get("schedule_cron")?,
            is_enabled: row.try_get("is_enabled")?,
            execution_status: row.try_get("execution_status")?,
            next_execute_time: row.try_get("next_execute_time")?,
            last_execute_time: row.try_get("last_execute_time")?,
            last_success_time: row.try_get("last_success_time")?,
            last_error_message: row.try_get("last_error_message")?,
            execute_count: row.try_get("execute_count")?,
            success_count: row.try_get("success_count")?,
            failure_count: row.try_get("failure_count")?,
            current_retry_count: row.try_get("current_retry_count")?,
            max_retries: row.try_get("max_retries")?,
            retry_interval_seconds: row.try_get("retry_interval_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// 领取到却无法解析的行标记为失败并停止调度
    async fn quarantine_unreadable(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        error: &SchedulerError,
        now: DateTime<Utc>,
        context: &TaskOperationContext,
    ) -> SchedulerResult<()> {
        warn!(task.id = id, error = %error, "任务数据无法解析，停止调度");
        sqlx::query(
            r#"
            UPDATE schedule_tasks
            SET execution_status = 'Failed', next_execute_time = NULL,
                last_error_message = $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(format!("任务数据无法解析，已停止调度: {error}"))
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;
        Ok(())
    }

    fn row_to_history(row: &PgRow) -> SchedulerResult<ExecutionHistoryRecord> {
        Ok(ExecutionHistoryRecord {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            channel: row.try_get("channel")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            duration_ms: row.try_get("duration_ms")?,
            is_success: row.try_get("is_success")?,
            error_message: row.try_get("error_message")?,
            http_status: row.try_get("http_status")?,
            response_size: row.try_get("response_size")?,
            emails_sent: row.try_get("emails_sent")?,
            files_transferred: row.try_get("files_transferred")?,
            bytes_transferred: row.try_get("bytes_transferred")?,
            execution_details: row.try_get("execution_details")?,
        })
    }

    fn row_to_exception(row: &PgRow) -> SchedulerResult<ExceptionRecord> {
        Ok(ExceptionRecord {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            channel: row.try_get("channel")?,
            exception_type: row.try_get("exception_type")?,
            exception_message: row.try_get("exception_message")?,
            context: MappingHelpers::parse_context_postgres(row, "context")?,
            occurred_at: row.try_get("occurred_at")?,
            is_resolved: row.try_get("is_resolved")?,
            resolved_by: row.try_get("resolved_by")?,
            resolved_at: row.try_get("resolved_at")?,
            resolve_note: row.try_get("resolve_note")?,
        })
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self), fields(task_id = %id))]
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<ScheduleTask>> {
        let context = task_context!(RepositoryOperation::Read, task_id = id);
        let sql = format!("SELECT {TASK_COLUMNS} FROM schedule_tasks WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<ScheduleTask>> {
        let context = task_context!(RepositoryOperation::Query, channel = filter.channel)
            .with_additional_info(format!("过滤器: {filter:?}"));

        let mut query = format!("SELECT {TASK_COLUMNS} FROM schedule_tasks WHERE 1=1");
        let mut bind_count = 0;
        if filter.channel.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND channel = ${bind_count}"));
        }
        if filter.execution_status.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND execution_status = ${bind_count}"));
        }
        if filter.is_enabled.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND is_enabled = ${bind_count}"));
        }
        query.push_str(" ORDER BY id");
        if filter.limit.is_some() {
            bind_count += 1;
            query.push_str(&format!(" LIMIT ${bind_count}"));
        }
        if filter.offset.is_some() {
            bind_count += 1;
            query.push_str(&format!(" OFFSET ${bind_count}"));
        }

        let mut sql_query = sqlx::query(&query);
        if let Some(channel) = filter.channel {
            sql_query = sql_query.bind(channel);
        }
        if let Some(status) = filter.execution_status {
            sql_query = sql_query.bind(status);
        }
        if let Some(enabled) = filter.is_enabled {
            sql_query = sql_query.bind(enabled);
        }
        if let Some(limit) = filter.limit {
            sql_query = sql_query.bind(limit);
        }
        if let Some(offset) = filter.offset {
            sql_query = sql_query.bind(offset);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self), fields(limit = %limit, channel = ?channel))]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        channel: Option<Channel>,
    ) -> SchedulerResult<Vec<ScheduleTask>> {
        let context = task_context!(RepositoryOperation::Claim, channel = channel);
        let db_err = |e| RepositoryErrorHelpers::task_database_error(context.clone(), e);

        // 行锁持有到提交，坏数据的隔离与领取一起生效
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM schedule_tasks
                WHERE is_enabled = TRUE
                  AND execution_status <> 'Processing'
                  AND next_execute_time IS NOT NULL
                  AND next_execute_time <= $1
                  AND ($2::VARCHAR IS NULL OR channel = $2::VARCHAR)
                ORDER BY next_execute_time, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE schedule_tasks AS t
            SET execution_status = 'Processing', last_execute_time = $1, updated_at = $1
            FROM due
            WHERE t.id = due.id
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(channel)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_task(row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    let id: i64 = row.try_get("id").map_err(db_err)?;
                    Self::quarantine_unreadable(&mut tx, id, &e, now, &context).await?;
                }
            }
        }
        tx.commit().await.map_err(db_err)?;
        tasks.sort_by_key(|t| (t.next_execute_time, t.id));
        debug!("领取到 {} 个到期任务", tasks.len());
        Ok(tasks)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn claim_by_id(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<ScheduleTask>> {
        let context = task_context!(RepositoryOperation::Claim, task_id = id);
        let db_err = |e| RepositoryErrorHelpers::task_database_error(context.clone(), e);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            r#"
            WITH target AS (
                SELECT id FROM schedule_tasks
                WHERE id = $2 AND execution_status <> 'Processing'
                FOR UPDATE SKIP LOCKED
            )
            UPDATE schedule_tasks AS t
            SET execution_status = 'Processing', last_execute_time = $1, updated_at = $1
            FROM target
            WHERE t.id = target.id
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let claimed = match row.as_ref().map(Self::row_to_task) {
            Some(Err(e)) => {
                Self::quarantine_unreadable(&mut tx, id, &e, now, &context).await?;
                tx.commit().await.map_err(db_err)?;
                return Err(e);
            }
            other => other.transpose()?,
        };
        tx.commit().await.map_err(db_err)?;

        match claimed {
            Some(task) => Ok(Some(task)),
            None => match self.get_by_id(id).await? {
                Some(_) => Ok(None),
                None => Err(RepositoryErrorHelpers::task_not_found(context)),
            },
        }
    }

    #[instrument(skip(self, commit), fields(task_id = %commit.task_id, success = %commit.success))]
    async fn commit_execution(&self, commit: &ExecutionCommit) -> SchedulerResult<()> {
        let context = task_context!(RepositoryOperation::Commit, task_id = commit.task_id);
        let db_err = |e| RepositoryErrorHelpers::task_database_error(context.clone(), e);

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let (success_inc, failure_inc): (i64, i64) = if commit.success { (1, 0) } else { (0, 1) };
        let updated = sqlx::query(
            r#"
            UPDATE schedule_tasks
            SET execution_status = $1,
                next_execute_time = $2,
                current_retry_count = $3,
                last_success_time = COALESCE($4, last_success_time),
                last_error_message = $5,
                execute_count = execute_count + 1,
                success_count = success_count + $6,
                failure_count = failure_count + $7,
                updated_at = $8
            WHERE id = $9
              AND execution_status = 'Processing'
              AND last_execute_time IS NOT DISTINCT FROM $10
            "#,
        )
        .bind(commit.execution_status)
        .bind(commit.next_execute_time)
        .bind(commit.current_retry_count)
        .bind(commit.last_success_time)
        .bind(&commit.last_error_message)
        .bind(success_inc)
        .bind(failure_inc)
        .bind(commit.recorded_at)
        .bind(commit.task_id)
        .bind(commit.claimed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(RepositoryErrorHelpers::claim_conflict(context.clone()));
        }

        let history = &commit.history;
        sqlx::query(
            r#"
            INSERT INTO schedule_execution_history (
                task_id, channel, start_time, end_time, duration_ms, is_success, error_message,
                http_status, response_size, emails_sent, files_transferred, bytes_transferred,
                execution_details
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(history.task_id)
        .bind(history.channel)
        .bind(history.start_time)
        .bind(history.end_time)
        .bind(history.duration_ms)
        .bind(history.is_success)
        .bind(&history.error_message)
        .bind(history.http_status)
        .bind(history.response_size)
        .bind(history.emails_sent)
        .bind(history.files_transferred)
        .bind(history.bytes_transferred)
        .bind(&history.execution_details)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(exception) = &commit.exception {
            let exception_context = serde_json::to_value(&exception.context).map_err(|e| {
                RepositoryErrorHelpers::task_serialization_error(context.clone(), e)
            })?;
            sqlx::query(
                r#"
                INSERT INTO schedule_exceptions (
                    task_id, channel, exception_type, exception_message, context,
                    occurred_at, is_resolved
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(exception.task_id)
            .bind(exception.channel)
            .bind(&exception.exception_type)
            .bind(&exception.exception_message)
            .bind(exception_context)
            .bind(exception.occurred_at)
            .bind(exception.is_resolved)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<i64>> {
        let context = task_context!(RepositoryOperation::Reclaim);
        let rows = sqlx::query(
            r#"
            UPDATE schedule_tasks
            SET execution_status = 'Pending', updated_at = $1
            WHERE execution_status = 'Processing'
              AND last_execute_time IS NOT NULL
              AND last_execute_time < $2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn list_history(
        &self,
        task_id: i64,
        limit: i64,
    ) -> SchedulerResult<Vec<ExecutionHistoryRecord>> {
        let context = task_context!(RepositoryOperation::Query, task_id = task_id);
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM schedule_execution_history \
             WHERE task_id = $1 ORDER BY start_time DESC, id DESC LIMIT $2"
        );

        let rows = sqlx::query(&sql)
            .bind(task_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        rows.iter().map(Self::row_to_history).collect()
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn list_exceptions(
        &self,
        task_id: i64,
        unresolved_only: bool,
    ) -> SchedulerResult<Vec<ExceptionRecord>> {
        let context = task_context!(RepositoryOperation::Query, task_id = task_id);
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM schedule_exceptions \
             WHERE task_id = $1 AND (NOT $2 OR is_resolved = FALSE) \
             ORDER BY occurred_at DESC, id DESC"
        );

        let rows = sqlx::query(&sql)
            .bind(task_id)
            .bind(unresolved_only)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        rows.iter().map(Self::row_to_exception).collect()
    }
}
