use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{models::Channel, SchedulerResult};

/// 触发结果，只反映领取数量，不包含执行结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerReport {
    pub claimed: usize,
    pub task_ids: Vec<i64>,
}

/// 外部触发入口
#[async_trait]
pub trait TriggerService: Send + Sync {
    /// 领取一批到期任务并交给执行池，领取完成后立即返回
    async fn trigger_due(
        &self,
        channel: Option<Channel>,
        limit: Option<i64>,
    ) -> SchedulerResult<TriggerReport>;

    /// 立即执行指定任务，不检查到期时间
    async fn trigger_task(&self, task_id: i64) -> SchedulerResult<TriggerReport>;
}
