use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    channels::{FtpConfig, HttpConfig, SmtpDefaults},
    database::DatabaseConfig,
    engine::{EngineConfig, RetryConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub mail: SmtpDefaults,
    pub http: HttpConfig,
    pub ftp: FtpConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides, e.g. `SCHEDULER__ENGINE__CLAIM_BATCH_SIZE=20`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/schedule-engine.toml", "schedule-engine.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.engine.validate().context("引擎配置验证失败")?;
        self.retry.validate().context("重试配置验证失败")?;
        self.mail.validate().context("邮件配置验证失败")?;
        self.http.validate().context("HTTP配置验证失败")?;
        self.ftp.validate().context("FTP配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.claim_batch_size, 50);
        assert_eq!(config.retry.default_max_retries, 3);
        assert_eq!(config.mail.smtp_port, 587);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [engine]
            claim_batch_size = 5
            max_concurrent_executions = 2

            [mail]
            smtp_host = "smtp.example.com"
            smtp_port = 465
            use_ssl = true
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.claim_batch_size, 5);
        assert_eq!(config.engine.max_concurrent_executions, 2);
        assert_eq!(config.engine.stale_processing_timeout_seconds, 1800);
        assert_eq!(config.mail.smtp_host.as_deref(), Some("smtp.example.com"));
        assert!(config.mail.use_ssl);
        assert_eq!(config.http.default_timeout_seconds, 30);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(AppConfig::from_toml("[engine]\nmax_concurrent_executions = 0").is_err());
        assert!(AppConfig::from_toml("[database]\nurl = \"mysql://localhost/db\"").is_err());
        assert!(AppConfig::from_toml("[mail]\nsmtp_username = \"only-user\"").is_err());
        assert!(AppConfig::from_toml("[observability]\nlog_format = \"xml\"").is_err());
    }

    #[test]
    fn test_toml_round_trip_and_file_load() {
        let mut config = AppConfig::default();
        config.retry.default_retry_interval_seconds = 15;
        let toml_str = config.to_toml().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_str.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.retry.default_retry_interval_seconds, 15);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        assert!(AppConfig::load(Some("/nonexistent/schedule-engine.toml")).is_err());
    }
}
