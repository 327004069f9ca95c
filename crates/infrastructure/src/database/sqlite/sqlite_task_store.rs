use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{
    traits::TaskStore, Channel, ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord,
    ScheduleTask, SchedulerError, SchedulerResult, TaskFilter,
};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::database::mapping::{
    MappingHelpers, EXCEPTION_COLUMNS, HISTORY_COLUMNS, TASK_COLUMNS,
};
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, TaskOperationContext};
use crate::task_context;

/// SQLite任务存储
///
/// 领取通过单条 `UPDATE ... RETURNING` 语句完成，状态条件同时出现在子查询和外层，
/// 相当于对状态字段做比较并交换；写锁由 SQLite 串行化，配合 busy_timeout 不会互相阻塞太久。
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并初始化表结构
    pub async fn connect(database_url: &str, max_connections: u32) -> SchedulerResult<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
        use std::str::FromStr;

        debug!("Creating SQLite task store at: {}", database_url);

        let in_memory = database_url.contains(":memory:");
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(if in_memory {
                SqliteJournalMode::Memory
            } else {
                SqliteJournalMode::Wal
            });

        // 内存库每个连接都是独立的数据库，只能保留一个常驻连接
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections)
        };

        let pool = pool_options.connect_with(connect_options).await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 运行数据库迁移
    pub async fn run_migrations(&self) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");
        let context = task_context!(RepositoryOperation::Migrate);

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS schedule_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                payload TEXT NOT NULL,
                schedule_cron TEXT,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                execution_status TEXT NOT NULL DEFAULT 'Pending',
                next_execute_time TEXT,
                last_execute_time TEXT,
                last_success_time TEXT,
                last_error_message TEXT,
                execute_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                current_retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER,
                retry_interval_seconds INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS schedule_execution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                channel TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                is_success INTEGER NOT NULL,
                error_message TEXT,
                http_status INTEGER,
                response_size INTEGER,
                emails_sent INTEGER,
                files_transferred INTEGER,
                bytes_transferred INTEGER,
                execution_details TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS schedule_exceptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                channel TEXT NOT NULL,
                exception_type TEXT NOT NULL,
                exception_message TEXT NOT NULL,
                context TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                is_resolved INTEGER NOT NULL DEFAULT 0,
                resolved_by TEXT,
                resolved_at TEXT,
                resolve_note TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_schedule_tasks_due ON schedule_tasks(is_enabled, execution_status, next_execute_time)",
            "CREATE INDEX IF NOT EXISTS idx_schedule_tasks_channel ON schedule_tasks(channel)",
            "CREATE INDEX IF NOT EXISTS idx_execution_history_task_id ON schedule_execution_history(task_id, start_time)",
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
        let payload = serde_json::to_string(&task.payload)
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

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<ScheduleTask> {
        Ok(ScheduleTask {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payload: MappingHelpers::parse_payload_sqlite(row, "payload")?,
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

    fn row_to_history(row: &SqliteRow) -> SchedulerResult<ExecutionHistoryRecord> {
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
            execution_details: MappingHelpers::parse_json_sqlite(row, "execution_details")?,
        })
    }

    fn row_to_exception(row: &SqliteRow) -> SchedulerResult<ExceptionRecord> {
        Ok(ExceptionRecord {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            channel: row.try_get("channel")?,
            exception_type: row.try_get("exception_type")?,
            exception_message: row.try_get("exception_message")?,
            context: MappingHelpers::parse_context_sqlite(row, "context")?,
            occurred_at: row.try_get("occurred_at")?,
            is_resolved: row.try_get("is_resolved")?,
            resolved_by: row.try_get("resolved_by")?,
            resolved_at: row.try_get("resolved_at")?,
            resolve_note: row.try_get("resolve_note")?,
        })
    }

    /// 领取到却无法解析的行标记为失败并停止调度，不再停留在 Processing
    async fn quarantine_unreadable(
        tx: &mut Transaction<'_, Sqlite>,
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

    fn sort_claimed(mut tasks: Vec<ScheduleTask>) -> Vec<ScheduleTask> {
        tasks.sort_by_key(|t| (t.next_execute_time, t.id));
        tasks
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
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
        if filter.limit.is_some() || filter.offset.is_some() {
            bind_count += 1;
            query.push_str(&format!(" LIMIT ${bind_count}"));
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
        if filter.limit.is_some() || filter.offset.is_some() {
            sql_query = sql_query
                .bind(filter.limit.unwrap_or(-1))
                .bind(filter.offset.unwrap_or(0));
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
        let sql = format!(
            r#"
            UPDATE schedule_tasks
            SET execution_status = 'Processing', last_execute_time = $1, updated_at = $1
            WHERE id IN (
                SELECT id FROM schedule_tasks
                WHERE is_enabled = 1
                  AND execution_status <> 'Processing'
                  AND next_execute_time IS NOT NULL
                  AND next_execute_time <= $1
                  AND ($2 IS NULL OR channel = $2)
                ORDER BY next_execute_time, id
                LIMIT $3
            )
            AND execution_status <> 'Processing'
            RETURNING {TASK_COLUMNS}
            "#
        );

        let db_err = |e| RepositoryErrorHelpers::task_database_error(context.clone(), e);

        // 领取与隔离坏数据在同一事务内，出错时整体回滚
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(&sql)
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
        debug!("领取到 {} 个到期任务", tasks.len());
        Ok(Self::sort_claimed(tasks))
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn claim_by_id(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<ScheduleTask>> {
        let context = task_context!(RepositoryOperation::Claim, task_id = id);
        let sql = format!(
            r#"
            UPDATE schedule_tasks
            SET execution_status = 'Processing', last_execute_time = $1, updated_at = $1
            WHERE id = $2 AND execution_status <> 'Processing'
            RETURNING {TASK_COLUMNS}
            "#
        );

        let db_err = |e| RepositoryErrorHelpers::task_database_error(context.clone(), e);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&sql)
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
        // 先释放连接再查询是否存在
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
            WHERE id = $9 AND execution_status = 'Processing' AND last_execute_time IS $10
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
        let details = history
            .execution_details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))?;
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
        .bind(details)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(exception) = &commit.exception {
            let exception_context = serde_json::to_string(&exception.context).map_err(|e| {
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
             WHERE task_id = $1 AND ($2 = 0 OR is_resolved = 0) \
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
