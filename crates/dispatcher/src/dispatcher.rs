//! 有界并发的任务分发
//!
//! 每个任务按通道找到传输实现，执行后交给执行记录器提交。
//! 并发上限由信号量控制；单个任务的失败（包括传输实现 panic）不会影响同批次其他任务。
//! 分发器不额外施加超时，超时由各传输实现自行负责。

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use scheduler_core::{ExecutionResult, ScheduleTask, TransportRegistry};
use scheduler_infrastructure::observability::MetricsCollector;

use crate::recorder::ExecutionRecorder;

/// 单个任务的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Succeeded,
    Failed,
    /// 结果未能提交，任务保持 `Processing` 等待回收
    NotRecorded,
}

/// 一批任务的分发汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_recorded: usize,
}

impl DispatchSummary {
    fn add(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::NotRecorded => self.not_recorded += 1,
        }
    }

    pub fn merge(&mut self, other: &DispatchSummary) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.not_recorded += other.not_recorded;
    }
}

pub struct Dispatcher {
    registry: TransportRegistry,
    recorder: Arc<ExecutionRecorder>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        registry: TransportRegistry,
        recorder: Arc<ExecutionRecorder>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            recorder,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 当前正在执行传输的任务数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 并发执行一批已领取的任务，全部处理完成后返回
    ///
    /// 信号量在多次 `dispatch` 调用之间共享，并发上限对整个进程生效。
    pub async fn dispatch(&self, tasks: Vec<ScheduleTask>) -> DispatchSummary {
        let mut summary = DispatchSummary {
            dispatched: tasks.len(),
            ..Default::default()
        };
        let mut running = JoinSet::new();

        for task in tasks {
            let permits = self.permits.clone();
            let registry = self.registry.clone();
            let recorder = self.recorder.clone();
            let in_flight = self.in_flight.clone();
            let metrics = self.metrics.clone();

            running.spawn(async move {
                // 信号量只会在进程退出时关闭
                let Ok(_permit) = permits.acquire_owned().await else {
                    return TaskOutcome::NotRecorded;
                };
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                metrics.set_in_flight(current);

                let outcome = execute_one(&registry, &recorder, &metrics, task).await;

                let current = in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics.set_in_flight(current);
                outcome
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => summary.add(outcome),
                Err(e) => {
                    error!(error = %e, "任务处理协程异常退出");
                    summary.add(TaskOutcome::NotRecorded);
                }
            }
        }

        debug!(?summary, "批次分发完成");
        summary
    }
}

async fn execute_one(
    registry: &TransportRegistry,
    recorder: &ExecutionRecorder,
    metrics: &MetricsCollector,
    task: ScheduleTask,
) -> TaskOutcome {
    let channel = task.channel();
    let start_time = Utc::now();
    let started = Instant::now();

    let result = match registry.get(channel) {
        Some(transport) => {
            // 在独立协程中执行，传输实现 panic 时转为失败结果
            let owned = task.clone();
            match tokio::spawn(async move { transport.execute(&owned).await }).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(task.id = task.id, error = %e, "传输实现异常终止");
                    ExecutionResult::failure("TransportPanic", format!("传输执行异常终止: {e}"))
                }
            }
        }
        None => ExecutionResult::failure(
            "TransportNotConfigured",
            format!("未配置{}通道的传输实现", channel),
        ),
    };

    let end_time = Utc::now();
    metrics.record_execution(channel, result.success, started.elapsed().as_secs_f64());

    match recorder.record(&task, &result, start_time, end_time).await {
        Ok(_) if result.success => TaskOutcome::Succeeded,
        Ok(_) => TaskOutcome::Failed,
        Err(_) => TaskOutcome::NotRecorded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_service::RetryCoordinator;
    use scheduler_core::{Channel, ExecutionStatus, TaskStore};
    use scheduler_testing_utils::{MockTaskStore, MockTransport, TaskBuilder};
    use std::time::Duration;

    fn processing(store: &MockTaskStore, builder: TaskBuilder) -> ScheduleTask {
        store.insert(builder.with_status(ExecutionStatus::Processing).build())
    }

    fn dispatcher(
        store: &MockTaskStore,
        registry: TransportRegistry,
        max_concurrent: usize,
    ) -> Dispatcher {
        let store: Arc<dyn TaskStore> = Arc::new(store.clone());
        let recorder = Arc::new(ExecutionRecorder::new(store, RetryCoordinator::default()));
        Dispatcher::new(registry, recorder, max_concurrent)
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let store = MockTaskStore::new();
        let tasks: Vec<_> = (0..12)
            .map(|_| processing(&store, TaskBuilder::new()))
            .collect();
        let transport =
            Arc::new(MockTransport::new(Channel::Http).with_delay(Duration::from_millis(30)));
        let registry = TransportRegistry::new().with(transport.clone());

        let summary = dispatcher(&store, registry, 3).dispatch(tasks).await;

        assert_eq!(summary.dispatched, 12);
        assert_eq!(summary.succeeded, 12);
        assert!(transport.peak_in_flight() <= 3);
        assert!(transport.peak_in_flight() >= 2);
        assert_eq!(transport.calls().len(), 12);
    }

    #[tokio::test]
    async fn test_failure_and_panic_are_isolated() {
        let store = MockTaskStore::new();
        let ok = processing(&store, TaskBuilder::new());
        let failing = processing(&store, TaskBuilder::new());
        let panicking = processing(&store, TaskBuilder::new());

        let transport = Arc::new(MockTransport::new(Channel::Http));
        transport.panic_on_task(panicking.id);
        let registry = TransportRegistry::new().with(transport.clone());
        let dispatcher = dispatcher(&store, registry, 1);

        // 按顺序执行，脚本结果依次对应
        let summary = dispatcher.dispatch(vec![ok.clone()]).await;
        assert_eq!(summary.succeeded, 1);
        transport.push_result(ExecutionResult::failure("UnexpectedStatus", "500"));
        let summary = dispatcher
            .dispatch(vec![failing.clone(), panicking.clone()])
            .await;

        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.not_recorded, 0);

        let panicked = store.task(panicking.id).unwrap();
        assert_eq!(panicked.failure_count, 1);
        assert!(panicked
            .last_error_message
            .unwrap()
            .contains("传输执行异常终止"));
        assert_eq!(
            store.task(ok.id).unwrap().execution_status,
            ExecutionStatus::Completed
        );
        assert_eq!(store.exceptions().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_transport_records_failure() {
        let store = MockTaskStore::new();
        let task = processing(&store, TaskBuilder::mail(&["ops@example.com"]));
        let registry = TransportRegistry::new().with(Arc::new(MockTransport::new(Channel::Http)));

        let summary = dispatcher(&store, registry, 2).dispatch(vec![task.clone()]).await;

        assert_eq!(summary.failed, 1);
        let exceptions = store.exceptions();
        assert_eq!(exceptions[0].exception_type, "TransportNotConfigured");
        assert_eq!(store.task(task.id).unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_task_processing() {
        let store = MockTaskStore::new();
        let task = processing(&store, TaskBuilder::new());
        store.set_fail_commits(true);
        let registry = TransportRegistry::new().with(Arc::new(MockTransport::new(Channel::Http)));

        let summary = dispatcher(&store, registry, 2).dispatch(vec![task.clone()]).await;

        assert_eq!(summary.not_recorded, 1);
        let stored = store.task(task.id).unwrap();
        assert_eq!(stored.execution_status, ExecutionStatus::Processing);
        assert_eq!(stored.execute_count, 0);
    }
}
