use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::TaskPayload;

/// 调度任务
///
/// 引擎只读取可执行的任务并回写状态、时间与计数字段；
/// 任务的创建、编辑、删除由外部的管理层负责。
///
/// - `schedule_cron` 为空表示一次性任务
/// - `next_execute_time` 为空表示不会再执行
/// - `max_retries`、`retry_interval_seconds` 为空时使用全局重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleTask {
    pub id: i64,
    pub name: String,
    pub payload: TaskPayload,
    pub schedule_cron: Option<String>,
    pub is_enabled: bool,
    pub execution_status: ExecutionStatus,
    pub next_execute_time: Option<DateTime<Utc>>,
    pub last_execute_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub execute_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub current_retry_count: i32,
    pub max_retries: Option<i32>,
    pub retry_interval_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleTask {
    /// 创建新的待执行任务，`id` 由存储层分配
    pub fn new(name: impl Into<String>, payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            payload,
            schedule_cron: None,
            is_enabled: true,
            execution_status: ExecutionStatus::Pending,
            next_execute_time: Some(now),
            last_execute_time: None,
            last_success_time: None,
            last_error_message: None,
            execute_count: 0,
            success_count: 0,
            failure_count: 0,
            current_retry_count: 0,
            max_retries: None,
            retry_interval_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn channel(&self) -> Channel {
        self.payload.channel()
    }

    pub fn is_one_shot(&self) -> bool {
        self.schedule_cron
            .as_deref()
            .map(|expr| expr.trim().is_empty())
            .unwrap_or(true)
    }

    /// 是否满足到期领取条件
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled
            && self.execution_status != ExecutionStatus::Processing
            && self.next_execute_time.map(|t| t <= now).unwrap_or(false)
    }
}

/// 任务通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "MAIL")]
    Mail,
    #[serde(rename = "FTP")]
    Ftp,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Http, Channel::Mail, Channel::Ftp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Http => "HTTP",
            Channel::Mail => "MAIL",
            Channel::Ftp => "FTP",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Channel::Http),
            "MAIL" => Ok(Channel::Mail),
            "FTP" => Ok(Channel::Ftp),
            _ => Err(format!("Invalid channel: {s}")),
        }
    }
}

/// 任务执行状态
///
/// `Pending → Processing → Completed | Failed`。
/// Completed/Failed 的周期任务在 `next_execute_time` 到期后重新进入领取范围。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Processing => "Processing",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ExecutionStatus::Pending),
            "Processing" => Ok(ExecutionStatus::Processing),
            "Completed" => Ok(ExecutionStatus::Completed),
            "Failed" => Ok(ExecutionStatus::Failed),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for ExecutionStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for ExecutionStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ExecutionStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ExecutionStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for ExecutionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ExecutionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

impl sqlx::Type<sqlx::Postgres> for Channel {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for Channel {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Channel {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for Channel {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for Channel {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for Channel {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务过滤器
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub channel: Option<Channel>,
    pub execution_status: Option<ExecutionStatus>,
    pub is_enabled: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payload::HttpPayload;
    use chrono::Duration;

    fn http_task() -> ScheduleTask {
        ScheduleTask::new(
            "ping",
            TaskPayload::Http(HttpPayload::new("http://localhost/ping")),
        )
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Processing,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("Running".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_channel_parse_is_case_insensitive() {
        assert_eq!("mail".parse::<Channel>(), Ok(Channel::Mail));
        assert_eq!("FTP".parse::<Channel>(), Ok(Channel::Ftp));
        assert!("sms".parse::<Channel>().is_err());
    }

    #[test]
    fn test_due_predicate() {
        let now = Utc::now();
        let mut task = http_task();
        task.next_execute_time = Some(now - Duration::seconds(1));
        assert!(task.is_due(now));

        // 已完成或失败的周期任务到期后重新可领取
        task.execution_status = ExecutionStatus::Completed;
        assert!(task.is_due(now));
        task.execution_status = ExecutionStatus::Failed;
        assert!(task.is_due(now));

        task.execution_status = ExecutionStatus::Processing;
        assert!(!task.is_due(now));

        task.execution_status = ExecutionStatus::Pending;
        task.is_enabled = false;
        assert!(!task.is_due(now));

        task.is_enabled = true;
        task.next_execute_time = None;
        assert!(!task.is_due(now));

        task.next_execute_time = Some(now + Duration::seconds(30));
        assert!(!task.is_due(now));
    }

    #[test]
    fn test_one_shot_detection() {
        let mut task = http_task();
        assert!(task.is_one_shot());
        task.schedule_cron = Some("  ".to_string());
        assert!(task.is_one_shot());
        task.schedule_cron = Some("*/5 * * * *".to_string());
        assert!(!task.is_one_shot());
        assert_eq!(task.channel(), Channel::Http);
    }
}
