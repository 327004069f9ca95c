//! In-memory test doubles for the store and transport traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{
    traits::{TaskStore, Transport},
    Channel, ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord, ExecutionResult,
    ExecutionStatus, ScheduleTask, SchedulerError, SchedulerResult, TaskFilter,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct StoreState {
    tasks: BTreeMap<i64, ScheduleTask>,
    history: Vec<ExecutionHistoryRecord>,
    exceptions: Vec<ExceptionRecord>,
    next_id: i64,
}

/// Mock implementation of TaskStore
///
/// 领取时在同一把锁内完成筛选与状态切换，语义与数据库的比较并交换一致。
#[derive(Debug, Clone, Default)]
pub struct MockTaskStore {
    state: Arc<Mutex<StoreState>>,
    writes: Arc<AtomicUsize>,
    fail_commits: Arc<AtomicBool>,
    fail_claims: Arc<AtomicBool>,
}

impl MockTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<ScheduleTask>) -> Self {
        let store = Self::new();
        for task in tasks {
            store.insert(task);
        }
        store
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 写入任务，`id` 为 0 时自动分配
    pub fn insert(&self, mut task: ScheduleTask) -> ScheduleTask {
        let mut state = self.state();
        if task.id == 0 {
            state.next_id += 1;
            task.id = state.next_id;
        } else {
            state.next_id = state.next_id.max(task.id);
        }
        state.tasks.insert(task.id, task.clone());
        task
    }

    pub fn task(&self, id: i64) -> Option<ScheduleTask> {
        self.state().tasks.get(&id).cloned()
    }

    pub fn history(&self) -> Vec<ExecutionHistoryRecord> {
        self.state().history.clone()
    }

    pub fn exceptions(&self) -> Vec<ExceptionRecord> {
        self.state().exceptions.clone()
    }

    /// 成功写入（领取、提交、回收）的次数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    fn check_claims(&self) -> SchedulerResult<()> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation("模拟数据库不可用".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MockTaskStore {
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<ScheduleTask>> {
        Ok(self.task(id))
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<ScheduleTask>> {
        let state = self.state();
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(state
            .tasks
            .values()
            .filter(|t| filter.channel.map_or(true, |c| t.channel() == c))
            .filter(|t| {
                filter
                    .execution_status
                    .map_or(true, |s| t.execution_status == s)
            })
            .filter(|t| filter.is_enabled.map_or(true, |e| t.is_enabled == e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        channel: Option<Channel>,
    ) -> SchedulerResult<Vec<ScheduleTask>> {
        self.check_claims()?;
        let mut state = self.state();

        let mut due: Vec<(Option<DateTime<Utc>>, i64)> = state
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .filter(|t| channel.map_or(true, |c| t.channel() == c))
            .map(|t| (t.next_execute_time, t.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.execution_status = ExecutionStatus::Processing;
                task.last_execute_time = Some(now);
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        if !claimed.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(claimed)
    }

    async fn claim_by_id(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<ScheduleTask>> {
        self.check_claims()?;
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        if task.execution_status == ExecutionStatus::Processing {
            return Ok(None);
        }
        task.execution_status = ExecutionStatus::Processing;
        task.last_execute_time = Some(now);
        task.updated_at = now;
        let claimed = task.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(claimed))
    }

    async fn commit_execution(&self, commit: &ExecutionCommit) -> SchedulerResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation("模拟提交失败".to_string()));
        }
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(&commit.task_id)
            .filter(|t| {
                t.execution_status == ExecutionStatus::Processing
                    && t.last_execute_time == commit.claimed_at
            })
            .ok_or(SchedulerError::ClaimConflict {
                id: commit.task_id,
            })?;
        commit.apply_to(task);

        let mut history = commit.history.clone();
        history.id = state.history.len() as i64 + 1;
        state.history.push(history);
        if let Some(exception) = &commit.exception {
            let mut exception = exception.clone();
            exception.id = state.exceptions.len() as i64 + 1;
            state.exceptions.push(exception);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<i64>> {
        self.check_claims()?;
        let mut state = self.state();
        let mut reclaimed = Vec::new();
        for task in state.tasks.values_mut() {
            let stale = task.execution_status == ExecutionStatus::Processing
                && task.last_execute_time.map_or(false, |t| t < stale_before);
            if stale {
                task.execution_status = ExecutionStatus::Pending;
                task.updated_at = now;
                reclaimed.push(task.id);
            }
        }
        if !reclaimed.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(reclaimed)
    }

    async fn list_history(
        &self,
        task_id: i64,
        limit: i64,
    ) -> SchedulerResult<Vec<ExecutionHistoryRecord>> {
        let state = self.state();
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|h| h.task_id == task_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_exceptions(
        &self,
        task_id: i64,
        unresolved_only: bool,
    ) -> SchedulerResult<Vec<ExceptionRecord>> {
        let state = self.state();
        Ok(state
            .exceptions
            .iter()
            .rev()
            .filter(|e| e.task_id == task_id)
            .filter(|e| !unresolved_only || !e.is_resolved)
            .cloned()
            .collect())
    }
}

/// Scripted transport
///
/// 按顺序返回预设结果，用尽后返回成功；记录调用次数和并发峰值。
#[derive(Debug, Clone)]
pub struct MockTransport {
    channel: Channel,
    script: Arc<Mutex<VecDeque<ExecutionResult>>>,
    delay: Duration,
    panic_on: Arc<Mutex<HashSet<i64>>>,
    calls: Arc<Mutex<Vec<i64>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            panic_on: Arc::new(Mutex::new(HashSet::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_result(&self, result: ExecutionResult) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// 执行该任务时直接 panic，用于验证故障隔离
    pub fn panic_on_task(&self, task_id: i64) {
        self.panic_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id);
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn execute(&self, task: &ScheduleTask) -> ExecutionResult {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.id);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let should_panic = self
            .panic_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&task.id);
        if should_panic {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            panic!("scripted transport panic for task {}", task.id);
        }

        let result = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::success(Default::default()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
