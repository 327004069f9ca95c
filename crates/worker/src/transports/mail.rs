use async_trait::async_trait;
use lettre::{
    address::Envelope,
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use scheduler_core::{
    config::SmtpDefaults,
    models::payload::MailBodyType,
    Channel, ExecutionMetadata, ExecutionResult, MailPayload, ScheduleTask, TaskPayload,
    Transport,
};

/// 解析后的SMTP连接参数
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub use_ssl: bool,
    pub timeout: Duration,
}

/// 邮件传输
///
/// 默认SMTP配置在构造时传入，任务缺省主机或凭据时使用。
pub struct MailTransport {
    defaults: SmtpDefaults,
}

impl MailTransport {
    pub fn new(defaults: SmtpDefaults) -> Self {
        Self { defaults }
    }

    /// 任务自带的主机和凭据优先，凭据按用户名整体覆盖
    pub fn resolve_settings(&self, payload: &MailPayload) -> Result<SmtpSettings, String> {
        let host = payload
            .smtp_host
            .clone()
            .or_else(|| self.defaults.smtp_host.clone())
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| "未配置SMTP主机".to_string())?;

        let credentials = match &payload.smtp_username {
            Some(username) => Some((
                username.clone(),
                payload.smtp_password.clone().unwrap_or_default(),
            )),
            None => self
                .defaults
                .smtp_username
                .clone()
                .map(|u| (u, self.defaults.smtp_password.clone().unwrap_or_default())),
        };

        Ok(SmtpSettings {
            host,
            port: payload.smtp_port.unwrap_or(self.defaults.smtp_port),
            credentials,
            use_ssl: payload.smtp_use_ssl.unwrap_or(self.defaults.use_ssl),
            timeout: Duration::from_secs(
                payload
                    .smtp_timeout_seconds
                    .unwrap_or(self.defaults.timeout_seconds),
            ),
        })
    }

    /// 构建邮件，信封收件人为按地址去重后的 To∪Cc∪Bcc
    pub async fn build_message(
        &self,
        payload: &MailPayload,
        settings: &SmtpSettings,
    ) -> Result<(Message, usize), String> {
        let sender = payload
            .sender
            .clone()
            .or_else(|| self.defaults.default_sender.clone())
            .or_else(|| settings.credentials.as_ref().map(|(u, _)| u.clone()))
            .ok_or_else(|| "未配置发件人".to_string())?;
        let sender_address: Address = parse_address(&sender)?;
        let from = Mailbox::new(payload.sender_name.clone(), sender_address.clone());

        let recipients = payload.all_recipients();
        if recipients.is_empty() {
            return Err("收件人列表为空".to_string());
        }
        // 带显示名的写法与纯地址指向同一收件人时只投递一次
        let mut seen = HashSet::new();
        let envelope_recipients = recipients
            .iter()
            .map(|r| parse_address(r))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|a| seen.insert(a.to_string().to_ascii_lowercase()))
            .collect::<Vec<_>>();
        let recipient_count = envelope_recipients.len();
        let envelope = Envelope::new(Some(sender_address), envelope_recipients)
            .map_err(|e| format!("构建邮件信封失败: {e}"))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(payload.subject.clone())
            .envelope(envelope);
        for to in &payload.to {
            builder = builder.to(parse_mailbox(to)?);
        }
        for cc in &payload.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        if let Some(reply_to) = &payload.reply_to {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }

        let content_type = match payload.body_type {
            MailBodyType::Html => ContentType::TEXT_HTML,
            MailBodyType::Text => ContentType::TEXT_PLAIN,
        };
        let body = SinglePart::builder()
            .header(content_type)
            .body(payload.body.clone());

        let message = if payload.attachments.is_empty() {
            builder.singlepart(body)
        } else {
            let mut multipart = MultiPart::mixed().singlepart(body);
            for path in &payload.attachments {
                match attachment(path).await {
                    Some(part) => multipart = multipart.singlepart(part),
                    None => warn!(attachment = %path, "附件不存在或无法读取，已跳过"),
                }
            }
            builder.multipart(multipart)
        }
        .map_err(|e| format!("构建邮件失败: {e}"))?;

        Ok((message, recipient_count))
    }

    async fn send(&self, payload: &MailPayload) -> ExecutionResult {
        let settings = match self.resolve_settings(payload) {
            Ok(settings) => settings,
            Err(message) => return ExecutionResult::failure("ConfigurationError", message),
        };
        let (message, recipient_count) = match self.build_message(payload, &settings).await {
            Ok(built) => built,
            Err(message) => return ExecutionResult::failure("MessageBuildError", message),
        };

        let mailer = match smtp_transport(&settings) {
            Ok(mailer) => mailer,
            Err(message) => return ExecutionResult::failure("SmtpError", message),
        };

        match mailer.send(message).await {
            Ok(response) => {
                info!(
                    host = %settings.host,
                    recipients = recipient_count,
                    code = %response.code(),
                    "邮件发送成功"
                );
                ExecutionResult::success(ExecutionMetadata {
                    emails_sent: Some(recipient_count as i32),
                    ..Default::default()
                })
            }
            Err(e) => ExecutionResult::failure("SmtpError", format!("邮件发送失败: {e}")),
        }
    }
}

fn smtp_transport(settings: &SmtpSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
    let builder = if settings.use_ssl {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
    }
    .map_err(|e| format!("SMTP连接配置失败: {e}"))?;

    let mut builder = builder
        .port(settings.port)
        .timeout(Some(settings.timeout));
    if let Some((username, password)) = &settings.credentials {
        builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
    }
    Ok(builder.build())
}

/// 信封只需要地址部分，`显示名 <地址>` 的写法同样接受
fn parse_address(raw: &str) -> Result<Address, String> {
    parse_mailbox(raw).map(|mailbox| mailbox.email)
}

fn parse_mailbox(raw: &str) -> Result<Mailbox, String> {
    raw.trim()
        .parse::<Mailbox>()
        .map_err(|e| format!("无效的邮件地址 '{raw}': {e}"))
}

async fn attachment(path: &str) -> Option<SinglePart> {
    let file_path = Path::new(path);
    let content = tokio::fs::read(file_path).await.ok()?;
    let file_name = file_path.file_name()?.to_string_lossy().into_owned();
    let content_type = ContentType::parse("application/octet-stream").ok()?;
    Some(Attachment::new(file_name).body(content, content_type))
}

#[async_trait]
impl Transport for MailTransport {
    fn channel(&self) -> Channel {
        Channel::Mail
    }

    async fn execute(&self, task: &ScheduleTask) -> ExecutionResult {
        match &task.payload {
            TaskPayload::Mail(payload) => self.send(payload).await,
            other => ExecutionResult::failure(
                "PayloadMismatch",
                format!("邮件传输收到{}通道的任务", other.channel()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SmtpDefaults {
        SmtpDefaults {
            smtp_host: Some("smtp.default.local".to_string()),
            smtp_port: 587,
            smtp_username: Some("robot@default.local".to_string()),
            smtp_password: Some("secret".to_string()),
            use_ssl: false,
            timeout_seconds: 10,
            default_sender: None,
        }
    }

    fn payload() -> MailPayload {
        MailPayload {
            to: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            cc: vec!["B@example.com".to_string()],
            bcc: vec!["c@example.com".to_string()],
            subject: "日报".to_string(),
            body: "<p>ok</p>".to_string(),
            body_type: MailBodyType::Html,
            ..Default::default()
        }
    }

    #[test]
    fn test_falls_back_to_default_smtp() {
        let transport = MailTransport::new(defaults());
        let settings = transport.resolve_settings(&payload()).unwrap();

        assert_eq!(settings.host, "smtp.default.local");
        assert_eq!(settings.port, 587);
        assert_eq!(
            settings.credentials,
            Some(("robot@default.local".to_string(), "secret".to_string()))
        );
        assert_eq!(settings.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_task_settings_override_defaults() {
        let transport = MailTransport::new(defaults());
        let mut payload = payload();
        payload.smtp_host = Some("smtp.task.local".to_string());
        payload.smtp_port = Some(465);
        payload.smtp_username = Some("task@task.local".to_string());
        payload.smtp_use_ssl = Some(true);

        let settings = transport.resolve_settings(&payload).unwrap();
        assert_eq!(settings.host, "smtp.task.local");
        assert_eq!(settings.port, 465);
        assert!(settings.use_ssl);
        assert_eq!(
            settings.credentials,
            Some(("task@task.local".to_string(), String::new()))
        );
    }

    #[test]
    fn test_missing_host_is_configuration_error() {
        let transport = MailTransport::new(SmtpDefaults::default());
        assert!(transport.resolve_settings(&payload()).is_err());
    }

    #[tokio::test]
    async fn test_message_envelope_is_deduplicated_union() {
        let transport = MailTransport::new(defaults());
        let settings = transport.resolve_settings(&payload()).unwrap();

        let (message, count) = transport
            .build_message(&payload(), &settings)
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(message.envelope().to().len(), 3);
        assert_eq!(
            message.envelope().from().map(|a| a.to_string()),
            Some("robot@default.local".to_string())
        );

        let formatted = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(formatted.contains("text/html"));
        // 密送不出现在邮件头中
        assert!(!formatted.contains("c@example.com"));
    }

    #[tokio::test]
    async fn test_attachments_and_invalid_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.csv");
        std::fs::write(&file, "a,b\n1,2\n").unwrap();

        let transport = MailTransport::new(defaults());
        let mut with_attachment = payload();
        with_attachment.attachments = vec![
            file.to_string_lossy().into_owned(),
            dir.path().join("missing.txt").to_string_lossy().into_owned(),
        ];
        let settings = transport.resolve_settings(&with_attachment).unwrap();
        let (message, _) = transport
            .build_message(&with_attachment, &settings)
            .await
            .unwrap();
        let formatted = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(formatted.contains("report.csv"));
        assert!(!formatted.contains("missing.txt"));

        let mut invalid = payload();
        invalid.to = vec!["not-an-address".to_string()];
        invalid.cc.clear();
        invalid.bcc.clear();
        assert!(transport.build_message(&invalid, &settings).await.is_err());

        let mut empty = payload();
        empty.to.clear();
        empty.cc.clear();
        empty.bcc.clear();
        assert!(transport.build_message(&empty, &settings).await.is_err());
    }

    #[tokio::test]
    async fn test_display_name_recipients_are_accepted() {
        let transport = MailTransport::new(defaults());
        let mut named = payload();
        named.sender = Some("Reports <reports@example.com>".to_string());
        named.to = vec!["Alice <a@example.com>".to_string()];
        named.cc = vec!["a@example.com".to_string()];
        named.bcc = vec!["Carol <c@example.com>".to_string()];
        let settings = transport.resolve_settings(&named).unwrap();

        let (message, count) = transport.build_message(&named, &settings).await.unwrap();
        assert_eq!(count, 2);
        let envelope: Vec<String> = message
            .envelope()
            .to()
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(envelope, vec!["a@example.com", "c@example.com"]);
        assert_eq!(
            message.envelope().from().map(|a| a.to_string()),
            Some("reports@example.com".to_string())
        );

        let formatted = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(formatted.contains("Alice"));
    }
}
