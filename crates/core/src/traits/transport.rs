use async_trait::async_trait;

use crate::models::{Channel, ExecutionResult, ScheduleTask};

/// 传输通道能力
///
/// 实现负责自身的超时与传输层重试，任何失败都以 `ExecutionResult` 形式返回。
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn execute(&self, task: &ScheduleTask) -> ExecutionResult;
}
