use serde::{Deserialize, Serialize};

/// 默认SMTP配置，任务未提供主机或凭据时使用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmtpDefaults {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub use_ssl: bool,
    pub timeout_seconds: u64,
    pub default_sender: Option<String>,
}

impl Default for SmtpDefaults {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            use_ssl: false,
            timeout_seconds: 30,
            default_sender: None,
        }
    }
}

impl SmtpDefaults {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.smtp_port == 0 {
            return Err(anyhow::anyhow!("SMTP端口必须大于0"));
        }

        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("SMTP超时时间必须大于0"));
        }

        if self.smtp_username.is_some() != self.smtp_password.is_some() {
            return Err(anyhow::anyhow!("SMTP用户名和密码必须同时配置"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub default_timeout_seconds: u64,
    pub user_agent: String,
    /// 写入执行详情的响应体最大字节数
    pub max_response_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            user_agent: format!("schedule-engine/{}", env!("CARGO_PKG_VERSION")),
            max_response_body_bytes: 4096,
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("HTTP超时时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    pub default_timeout_seconds: u64,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
        }
    }
}

impl FtpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("FTP超时时间必须大于0"));
        }
        Ok(())
    }
}
