use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::task::Channel;
use crate::errors::{SchedulerError, SchedulerResult};

/// 通道相关的任务配置，按通道区分的封闭变体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel")]
pub enum TaskPayload {
    #[serde(rename = "HTTP")]
    Http(HttpPayload),
    #[serde(rename = "MAIL")]
    Mail(MailPayload),
    #[serde(rename = "FTP")]
    Ftp(FtpPayload),
}

impl TaskPayload {
    pub fn channel(&self) -> Channel {
        match self {
            TaskPayload::Http(_) => Channel::Http,
            TaskPayload::Mail(_) => Channel::Mail,
            TaskPayload::Ftp(_) => Channel::Ftp,
        }
    }

    /// 结构校验，在任务创建时由管理层调用
    pub fn validate(&self) -> SchedulerResult<()> {
        match self {
            TaskPayload::Http(http) => {
                if http.url.trim().is_empty() {
                    return Err(SchedulerError::ValidationError("HTTP任务的URL不能为空".to_string()));
                }
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    return Err(SchedulerError::ValidationError(format!(
                        "HTTP任务的URL必须以http://或https://开头: {}",
                        http.url
                    )));
                }
                if !(100..=599).contains(&http.expected_status) {
                    return Err(SchedulerError::ValidationError(format!(
                        "无效的期望状态码: {}",
                        http.expected_status
                    )));
                }
            }
            TaskPayload::Mail(mail) => {
                if mail.to.is_empty() && mail.cc.is_empty() && mail.bcc.is_empty() {
                    return Err(SchedulerError::ValidationError("邮件任务至少需要一个收件人".to_string()));
                }
                if mail.subject.trim().is_empty() {
                    return Err(SchedulerError::ValidationError("邮件主题不能为空".to_string()));
                }
            }
            TaskPayload::Ftp(ftp) => {
                if ftp.host.trim().is_empty() {
                    return Err(SchedulerError::ValidationError("FTP主机不能为空".to_string()));
                }
                if ftp.local_path.trim().is_empty() || ftp.remote_path.trim().is_empty() {
                    return Err(SchedulerError::ValidationError("FTP本地路径和远程路径不能为空".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// HTTP 调用配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpPayload {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// 单次执行内的传输层重试次数
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_transport_retry_interval")]
    pub retry_interval_seconds: u64,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

impl HttpPayload {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_http_method(),
            headers: HashMap::new(),
            body: None,
            content_type: default_content_type(),
            timeout_seconds: None,
            retry_count: 0,
            retry_interval_seconds: default_transport_retry_interval(),
            expected_status: default_expected_status(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MailBodyType {
    #[default]
    Text,
    Html,
}

/// 邮件发送配置，SMTP 字段缺省时回落到全局默认配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MailPayload {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_type: MailBodyType,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_use_ssl: Option<bool>,
    #[serde(default)]
    pub smtp_timeout_seconds: Option<u64>,
}

impl MailPayload {
    /// To/Cc/Bcc 去重后的全部收件人
    pub fn all_recipients(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .filter(|addr| seen.insert(addr.to_ascii_lowercase()))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileProtocol {
    #[default]
    Ftp,
    Sftp,
}

impl FileProtocol {
    pub fn default_port(&self) -> u16 {
        match self {
            FileProtocol::Ftp => 21,
            FileProtocol::Sftp => 22,
        }
    }
}

/// 文件上传配置
///
/// `local_path` 含通配符（`*`、`?`、`[`）时按模式批量上传，
/// 此时 `remote_path` 视为远程目录。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FtpPayload {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub protocol: FileProtocol,
    #[serde(default = "default_true")]
    pub passive: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub local_path: String,
    pub remote_path: String,
    #[serde(default = "default_true")]
    pub overwrite_existing: bool,
    #[serde(default = "default_true")]
    pub create_remote_directory: bool,
    #[serde(default)]
    pub delete_local_after_upload: bool,
}

impl FtpPayload {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn is_pattern(&self) -> bool {
        self.local_path.contains(['*', '?', '['])
    }
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_transport_retry_interval() -> u64 {
    5
}

fn default_expected_status() -> u16 {
    200
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_payload_defaults() {
        let payload: TaskPayload =
            serde_json::from_value(json!({"channel": "HTTP", "url": "https://example.com/hook"}))
                .unwrap();
        match &payload {
            TaskPayload::Http(http) => {
                assert_eq!(http.method, "GET");
                assert_eq!(http.expected_status, 200);
                assert_eq!(http.retry_count, 0);
                assert_eq!(http.content_type, "application/json");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(payload.channel(), Channel::Http);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_mail_recipient_union_is_deduplicated() {
        let mail = MailPayload {
            to: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            cc: vec!["B@example.com".to_string(), "c@example.com".to_string()],
            bcc: vec!["a@example.com".to_string(), " ".to_string()],
            subject: "日报".to_string(),
            ..Default::default()
        };
        assert_eq!(
            mail.all_recipients(),
            vec!["a@example.com", "b@example.com", "c@example.com"]
        );
    }

    #[test]
    fn test_ftp_port_and_pattern() {
        let payload: FtpPayload = serde_json::from_value(json!({
            "host": "files.example.com",
            "protocol": "SFTP",
            "local_path": "/data/out/*.csv",
            "remote_path": "/inbox"
        }))
        .unwrap();
        assert_eq!(payload.effective_port(), 22);
        assert!(payload.is_pattern());
        assert!(payload.passive);
        assert!(!payload.delete_local_after_upload);
    }

    #[test]
    fn test_validation_rejects_bad_payloads() {
        let bad_url = TaskPayload::Http(HttpPayload::new("ftp://nope"));
        assert!(matches!(
            bad_url.validate(),
            Err(SchedulerError::ValidationError(_))
        ));

        let no_recipient = TaskPayload::Mail(MailPayload {
            subject: "hello".to_string(),
            ..Default::default()
        });
        assert!(no_recipient.validate().is_err());
    }
}
