use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::TaskPayload;
use super::task::{Channel, ExecutionStatus, ScheduleTask};

/// 传输通道返回的执行结果
///
/// 传输层的所有错误都折叠为 `success = false` 的结果，不会向调度方抛出。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub error_message: Option<String>,
    /// 异常类型，例如 `UnexpectedStatus`、`SmtpError`
    pub exception_type: Option<String>,
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    pub fn success(metadata: ExecutionMetadata) -> Self {
        Self {
            success: true,
            error_message: None,
            exception_type: None,
            metadata,
        }
    }

    pub fn failure(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            exception_type: Some(exception_type.into()),
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 通道相关的执行元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetadata {
    pub http_status: Option<u16>,
    pub response_size: Option<i64>,
    pub emails_sent: Option<i32>,
    pub files_transferred: Option<i32>,
    pub bytes_transferred: Option<i64>,
    pub details: Option<serde_json::Value>,
}

/// 执行历史，每次尝试一条，写入后不再修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionHistoryRecord {
    pub id: i64,
    pub task_id: i64,
    pub channel: Channel,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub is_success: bool,
    pub error_message: Option<String>,
    pub http_status: Option<i32>,
    pub response_size: Option<i64>,
    pub emails_sent: Option<i32>,
    pub files_transferred: Option<i32>,
    pub bytes_transferred: Option<i64>,
    pub execution_details: Option<serde_json::Value>,
}

impl ExecutionHistoryRecord {
    pub fn from_result(
        task: &ScheduleTask,
        result: &ExecutionResult,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let metadata = &result.metadata;
        Self {
            id: 0,
            task_id: task.id,
            channel: task.channel(),
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds().max(0),
            is_success: result.success,
            error_message: result.error_message.clone(),
            http_status: metadata.http_status.map(i32::from),
            response_size: metadata.response_size,
            emails_sent: metadata.emails_sent,
            files_transferred: metadata.files_transferred,
            bytes_transferred: metadata.bytes_transferred,
            execution_details: metadata.details.clone(),
        }
    }
}

/// 异常上下文，供运维排查
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel")]
pub enum ExceptionContext {
    #[serde(rename = "HTTP")]
    Http {
        url: String,
        method: String,
        status: Option<u16>,
    },
    #[serde(rename = "MAIL")]
    Mail {
        recipients: Vec<String>,
        subject: String,
    },
    #[serde(rename = "FTP")]
    Ftp {
        host: String,
        local_path: String,
        remote_path: String,
    },
}

impl ExceptionContext {
    pub fn from_payload(payload: &TaskPayload, metadata: &ExecutionMetadata) -> Self {
        match payload {
            TaskPayload::Http(http) => ExceptionContext::Http {
                url: http.url.clone(),
                method: http.method.to_ascii_uppercase(),
                status: metadata.http_status,
            },
            TaskPayload::Mail(mail) => ExceptionContext::Mail {
                recipients: mail.all_recipients(),
                subject: mail.subject.clone(),
            },
            TaskPayload::Ftp(ftp) => ExceptionContext::Ftp {
                host: ftp.host.clone(),
                local_path: ftp.local_path.clone(),
                remote_path: ftp.remote_path.clone(),
            },
        }
    }
}

/// 异常记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionRecord {
    pub id: i64,
    pub task_id: i64,
    pub channel: Channel,
    pub exception_type: String,
    pub exception_message: String,
    pub context: ExceptionContext,
    pub occurred_at: DateTime<Utc>,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolve_note: Option<String>,
}

impl ExceptionRecord {
    pub fn from_failure(
        task: &ScheduleTask,
        result: &ExecutionResult,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            task_id: task.id,
            channel: task.channel(),
            exception_type: result
                .exception_type
                .clone()
                .unwrap_or_else(|| "TransportError".to_string()),
            exception_message: result
                .error_message
                .clone()
                .unwrap_or_else(|| "未知错误".to_string()),
            context: ExceptionContext::from_payload(&task.payload, &result.metadata),
            occurred_at,
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolve_note: None,
        }
    }
}

/// 一次执行需要原子提交的全部变更
///
/// 计数器在存储层以自增方式更新，`last_success_time` 为空时保留原值。
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCommit {
    pub task_id: i64,
    /// 领取时写入的 `last_execute_time`，提交时据此确认仍属于同一次领取
    pub claimed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub execution_status: ExecutionStatus,
    pub next_execute_time: Option<DateTime<Utc>>,
    pub current_retry_count: i32,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub history: ExecutionHistoryRecord,
    pub exception: Option<ExceptionRecord>,
}

impl ExecutionCommit {
    /// 将提交内容应用到内存中的任务副本
    pub fn apply_to(&self, task: &mut ScheduleTask) {
        task.execution_status = self.execution_status;
        task.next_execute_time = self.next_execute_time;
        task.current_retry_count = self.current_retry_count;
        task.last_error_message = self.last_error_message.clone();
        if self.last_success_time.is_some() {
            task.last_success_time = self.last_success_time;
        }
        task.execute_count += 1;
        if self.success {
            task.success_count += 1;
        } else {
            task.failure_count += 1;
        }
        task.updated_at = self.recorded_at;
    }
}
