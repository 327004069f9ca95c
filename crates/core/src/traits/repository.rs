//! 任务存储接口
//!
//! 任务表是引擎唯一的共享可变状态。所有写入只能经过两条路径：
//! - 领取（`claim_due` / `claim_by_id`），把任务原子地切换到 `Processing`
//! - 执行提交（`commit_execution`），在一个事务内回写任务字段并追加历史与异常
//!
//! 领取采用"跳过已锁定行"的语义：并发的领取方之间不会互相等待，
//! 被其他领取方持有的行直接从结果中排除。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        Channel, ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord, ScheduleTask,
        TaskFilter,
    },
    SchedulerResult,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 根据ID获取任务
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<ScheduleTask>>;

    /// 根据过滤条件查询任务
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<ScheduleTask>>;

    /// 原子领取最多 `limit` 个到期任务
    ///
    /// 到期条件：启用、`next_execute_time <= now`、状态不是 `Processing`。
    /// 领取的任务状态置为 `Processing`，`last_execute_time = now`，返回完整行。
    /// 没有到期任务时不产生任何写入。
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        channel: Option<Channel>,
    ) -> SchedulerResult<Vec<ScheduleTask>>;

    /// 领取指定任务，忽略到期时间与启用标记
    ///
    /// 任务不存在返回 `TaskNotFound`；任务正在执行返回 `Ok(None)`。
    async fn claim_by_id(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<ScheduleTask>>;

    /// 原子提交一次执行的结果
    ///
    /// 任务不再处于 `Processing` 时整体回滚并返回 `ClaimConflict`。
    async fn commit_execution(&self, commit: &ExecutionCommit) -> SchedulerResult<()>;

    /// 将 `last_execute_time` 早于 `stale_before` 的执行中任务放回 `Pending`
    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<i64>>;

    /// 查询任务的执行历史，按开始时间倒序
    async fn list_history(
        &self,
        task_id: i64,
        limit: i64,
    ) -> SchedulerResult<Vec<ExecutionHistoryRecord>>;

    /// 查询任务的异常记录
    async fn list_exceptions(
        &self,
        task_id: i64,
        unresolved_only: bool,
    ) -> SchedulerResult<Vec<ExceptionRecord>>;
}
