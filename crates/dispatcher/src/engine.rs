//! 调度执行引擎
//!
//! 外部触发（周期调用方或手动请求）进入 `ScheduleEngine`：
//! 回收僵死任务 → 原子领取 → 投递到执行池后立即返回。
//! 执行池在调用路径之外完成 分发 → 记录 的流程。
//! 引擎本身不持有定时器，每次触发都可以安全地重入。

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument};

use scheduler_core::{
    config::{EngineConfig, RetryConfig},
    Channel, ScheduleTask, SchedulerError, SchedulerResult, TaskStore, TransportRegistry,
    TriggerReport, TriggerService,
};

use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::recorder::ExecutionRecorder;
use crate::recovery_service::StaleTaskReaper;
use crate::retry_service::RetryCoordinator;
use crate::selector::DueTaskSelector;

/// 执行池
///
/// 领取到的批次通过无界队列交给后台协程，每个批次独立分发；
/// 并发上限由共享的 `Dispatcher` 信号量控制。
pub struct ExecutionPool {
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<ScheduleTask>>>>,
    worker: Mutex<Option<JoinHandle<DispatchSummary>>>,
}

impl ExecutionPool {
    pub fn start(dispatcher: Arc<Dispatcher>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<ScheduleTask>>();

        let worker = tokio::spawn(async move {
            let mut running: JoinSet<DispatchSummary> = JoinSet::new();
            let mut total = DispatchSummary::default();

            loop {
                tokio::select! {
                    batch = receiver.recv() => match batch {
                        Some(batch) => {
                            let dispatcher = dispatcher.clone();
                            running.spawn(async move { dispatcher.dispatch(batch).await });
                        }
                        None => break,
                    },
                    Some(joined) = running.join_next(), if !running.is_empty() => {
                        collect(&mut total, joined);
                    }
                }
            }

            // 队列已关闭，等待剩余批次完成
            while let Some(joined) = running.join_next().await {
                collect(&mut total, joined);
            }
            info!(
                dispatched = total.dispatched,
                succeeded = total.succeeded,
                failed = total.failed,
                not_recorded = total.not_recorded,
                "执行池已排空"
            );
            total
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// 投递一批已领取的任务，不等待执行
    pub async fn submit(&self, tasks: Vec<ScheduleTask>) -> SchedulerResult<()> {
        let guard = self.sender.lock().await;
        let sender = guard
            .as_ref()
            .ok_or_else(|| SchedulerError::Internal("执行池已关闭".to_string()))?;
        sender
            .send(tasks)
            .map_err(|_| SchedulerError::Internal("执行池已停止接收任务".to_string()))
    }

    /// 停止接收新批次，并等待已投递的批次全部记录完成
    pub async fn drain(&self) -> DispatchSummary {
        self.sender.lock().await.take();
        let Some(worker) = self.worker.lock().await.take() else {
            return DispatchSummary::default();
        };
        match worker.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "执行池后台协程异常退出");
                DispatchSummary::default()
            }
        }
    }
}

fn collect(total: &mut DispatchSummary, joined: Result<DispatchSummary, tokio::task::JoinError>) {
    match joined {
        Ok(summary) => total.merge(&summary),
        Err(e) => error!(error = %e, "批次分发协程异常退出"),
    }
}

/// 引擎门面，实现外部触发接口
pub struct ScheduleEngine {
    selector: DueTaskSelector,
    reaper: StaleTaskReaper,
    dispatcher: Arc<Dispatcher>,
    pool: ExecutionPool,
}

impl ScheduleEngine {
    /// 创建引擎并启动执行池，需要在 tokio 运行时中调用
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: TransportRegistry,
        engine_config: &EngineConfig,
        retry_config: &RetryConfig,
    ) -> Self {
        let recorder = Arc::new(ExecutionRecorder::new(
            store.clone(),
            RetryCoordinator::new(retry_config.clone()),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            recorder,
            engine_config.max_concurrent_executions,
        ));

        info!(
            claim_batch_size = engine_config.claim_batch_size,
            max_concurrent = engine_config.max_concurrent_executions,
            stale_timeout_seconds = engine_config.stale_processing_timeout_seconds,
            "调度执行引擎已创建"
        );

        Self {
            selector: DueTaskSelector::new(store.clone(), engine_config.claim_batch_size),
            reaper: StaleTaskReaper::new(store, engine_config.stale_processing_timeout_seconds),
            pool: ExecutionPool::start(dispatcher.clone()),
            dispatcher,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// 停止接收触发并等待执行池排空
    pub async fn shutdown(&self) -> DispatchSummary {
        info!("正在排空执行池");
        self.pool.drain().await
    }

    async fn hand_off(&self, tasks: Vec<ScheduleTask>) -> SchedulerResult<TriggerReport> {
        let report = TriggerReport {
            claimed: tasks.len(),
            task_ids: tasks.iter().map(|t| t.id).collect(),
        };
        if !tasks.is_empty() {
            if let Err(e) = self.pool.submit(tasks).await {
                // 已领取的任务留在 Processing，由回收器处理
                error!(task_ids = ?report.task_ids, error = %e, "投递到执行池失败");
                return Err(e);
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl TriggerService for ScheduleEngine {
    #[instrument(skip(self))]
    async fn trigger_due(
        &self,
        channel: Option<Channel>,
        limit: Option<i64>,
    ) -> SchedulerResult<TriggerReport> {
        let now = Utc::now();
        self.reaper.reap(now).await?;

        let tasks = self.selector.claim(now, channel, limit).await?;
        debug!(claimed = tasks.len(), "本次触发领取完成");
        self.hand_off(tasks).await
    }

    #[instrument(skip(self))]
    async fn trigger_task(&self, task_id: i64) -> SchedulerResult<TriggerReport> {
        let claimed = self.selector.claim_one(task_id, Utc::now()).await?;
        self.hand_off(claimed.into_iter().collect()).await
    }
}
