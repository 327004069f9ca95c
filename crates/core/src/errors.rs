use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidExpression { expr: String, message: String },

    #[error("任务配置校验失败: {0}")]
    ValidationError(String),

    #[error("传输通道错误: {0}")]
    Transport(String),

    #[error("任务 {id} 已不处于执行中状态，放弃提交")]
    ClaimConflict { id: i64 },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 存储层不可用，当前触发周期应当中止
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::DatabaseOperation(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(SchedulerError::DatabaseOperation("连接断开".to_string()).is_store_error());
        assert!(SchedulerError::Database(sqlx::Error::PoolTimedOut).is_store_error());
        assert!(!SchedulerError::ClaimConflict { id: 1 }.is_store_error());
        assert!(!SchedulerError::InvalidExpression {
            expr: "bad".to_string(),
            message: "语法错误".to_string()
        }
        .is_store_error());
    }

    #[test]
    fn test_error_messages() {
        let err = SchedulerError::TaskNotFound { id: 42 };
        assert_eq!(err.to_string(), "任务未找到: 42");

        let err: SchedulerError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
