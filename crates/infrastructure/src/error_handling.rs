//! 存储层错误处理
//!
//! 为任务存储的每个操作附带上下文（操作类型、任务ID、通道），
//! 在映射为 `SchedulerError` 之前输出结构化日志。

use chrono::{DateTime, Utc};
use scheduler_core::{Channel, SchedulerError};
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::{error, instrument, warn};

/// Operation context for repository operations
#[derive(Debug, Clone)]
pub enum RepositoryOperation {
    Create,
    Read,
    Query,
    Claim,
    Commit,
    Reclaim,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Query => write!(f, "条件查询"),
            RepositoryOperation::Claim => write!(f, "领取"),
            RepositoryOperation::Commit => write!(f, "提交执行结果"),
            RepositoryOperation::Reclaim => write!(f, "回收"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// Context information for task store operations
#[derive(Debug, Clone)]
pub struct TaskOperationContext {
    pub operation: RepositoryOperation,
    pub task_id: Option<i64>,
    pub channel: Option<Channel>,
    pub timestamp: DateTime<Utc>,
    pub additional_info: Option<String>,
}

impl TaskOperationContext {
    pub fn new(operation: RepositoryOperation) -> Self {
        Self {
            operation,
            task_id: None,
            channel: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_channel(mut self, channel: Option<Channel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_additional_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.task_id, &self.channel) {
            (Some(id), Some(channel)) => format!("{channel}任务 (ID: {id})"),
            (Some(id), None) => format!("任务 (ID: {id})"),
            (None, Some(channel)) => format!("{channel}任务"),
            (None, None) => "任务".to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    /// Create a database error with task context
    #[instrument(skip_all, fields(
        operation = %context.operation,
        task_id = ?context.task_id,
        channel = ?context.channel,
        timestamp = %context.timestamp,
    ))]
    pub fn task_database_error(context: TaskOperationContext, error: SqlxError) -> SchedulerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::PoolTimedOut => {
                format!("{operation_desc}{entity_desc}时获取数据库连接超时")
            }
            SqlxError::Database(db_error) if db_error.constraint().is_some() => {
                format!(
                    "{}{}时违反约束 {}: {}",
                    operation_desc,
                    entity_desc,
                    db_error.constraint().unwrap_or_default(),
                    db_error.message()
                )
            }
            _ => format!("{operation_desc}{entity_desc}时发生数据库错误: {error}"),
        };

        match &context.additional_info {
            Some(info) => error!(error = %error, info = %info, "{}", error_msg),
            None => error!(error = %error, "{}", error_msg),
        }

        SchedulerError::DatabaseOperation(error_msg)
    }

    /// Create a serialization error for a stored payload
    pub fn task_serialization_error(
        context: TaskOperationContext,
        error: serde_json::Error,
    ) -> SchedulerError {
        let error_msg = format!(
            "{}{}时序列化数据失败: {}",
            context.operation,
            context.entity_description(),
            error
        );
        error!("{}", error_msg);
        SchedulerError::Serialization(error_msg)
    }

    /// Create a task not found error with context
    pub fn task_not_found(context: TaskOperationContext) -> SchedulerError {
        let entity_desc = context.entity_description();
        warn!("{}{}时未找到: {} 不存在", context.operation, entity_desc, entity_desc);
        SchedulerError::TaskNotFound {
            id: context.task_id.unwrap_or(0),
        }
    }

    /// The commit guard found the task outside `Processing`
    pub fn claim_conflict(context: TaskOperationContext) -> SchedulerError {
        warn!(
            "{}{}时任务已不处于执行中状态，事务已回滚",
            context.operation,
            context.entity_description()
        );
        SchedulerError::ClaimConflict {
            id: context.task_id.unwrap_or(0),
        }
    }
}

/// Macro for creating task operation context easily
#[macro_export]
macro_rules! task_context {
    ($operation:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
    };
    ($operation:expr, task_id = $task_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation).with_task_id($task_id)
    };
    ($operation:expr, channel = $channel:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation).with_channel($channel)
    };
}
