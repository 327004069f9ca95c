use serde::{Deserialize, Serialize};

/// 执行引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 单次触发最多领取的任务数
    pub claim_batch_size: i64,
    /// 同时执行的任务上限
    pub max_concurrent_executions: usize,
    /// 执行中任务超过该时长视为僵死并放回待执行，0 表示不回收
    pub stale_processing_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 50,
            max_concurrent_executions: 10,
            stale_processing_timeout_seconds: 1800,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.claim_batch_size <= 0 {
            return Err(anyhow::anyhow!("领取批次大小必须大于0"));
        }

        if self.max_concurrent_executions == 0 {
            return Err(anyhow::anyhow!("最大并发执行数必须大于0"));
        }

        Ok(())
    }
}

/// 引擎级重试默认值，任务未单独配置时使用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default_max_retries: i32,
    pub default_retry_interval_seconds: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_retry_interval_seconds: 60,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("默认重试次数不能为负数"));
        }

        if self.default_retry_interval_seconds <= 0 {
            return Err(anyhow::anyhow!("默认重试间隔必须大于0"));
        }

        Ok(())
    }
}
