//! Test data builders

use chrono::{DateTime, Duration, Utc};
use scheduler_core::models::{
    ExecutionStatus, FileProtocol, FtpPayload, HttpPayload, MailPayload, ScheduleTask,
    TaskPayload,
};

/// Builder for creating test ScheduleTask entities
pub struct TaskBuilder {
    task: ScheduleTask,
}

impl TaskBuilder {
    /// 一个已到期、一次性的 HTTP 任务
    pub fn new() -> Self {
        let mut task = ScheduleTask::new(
            "test_task",
            TaskPayload::Http(HttpPayload::new("http://127.0.0.1:9/health")),
        );
        task.next_execute_time = Some(Utc::now() - Duration::seconds(1));
        Self { task }
    }

    pub fn http(url: &str) -> Self {
        Self::new().with_payload(TaskPayload::Http(HttpPayload::new(url)))
    }

    pub fn mail(to: &[&str]) -> Self {
        Self::new().with_payload(TaskPayload::Mail(MailPayload {
            to: to.iter().map(|s| s.to_string()).collect(),
            subject: "测试邮件".to_string(),
            body: "hello".to_string(),
            ..Default::default()
        }))
    }

    pub fn ftp(local_path: &str, remote_path: &str) -> Self {
        Self::new().with_payload(TaskPayload::Ftp(FtpPayload {
            host: "127.0.0.1".to_string(),
            port: None,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            protocol: FileProtocol::Ftp,
            passive: true,
            timeout_seconds: Some(5),
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            overwrite_existing: true,
            create_remote_directory: true,
            delete_local_after_upload: false,
        }))
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_cron(mut self, expr: &str) -> Self {
        self.task.schedule_cron = Some(expr.to_string());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.task.is_enabled = enabled;
        self
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.task.execution_status = status;
        self
    }

    pub fn with_next_execute_time(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.task.next_execute_time = time;
        self
    }

    pub fn with_last_execute_time(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.task.last_execute_time = time;
        self
    }

    pub fn due_in(mut self, offset: Duration) -> Self {
        self.task.next_execute_time = Some(Utc::now() + offset);
        self
    }

    pub fn with_retry_policy(mut self, max_retries: i32, interval_seconds: i64) -> Self {
        self.task.max_retries = Some(max_retries);
        self.task.retry_interval_seconds = Some(interval_seconds);
        self
    }

    pub fn with_current_retry_count(mut self, count: i32) -> Self {
        self.task.current_retry_count = count;
        self
    }

    pub fn build(self) -> ScheduleTask {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
