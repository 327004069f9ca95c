use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

use scheduler_core::{SchedulerResult, TaskStore};
use scheduler_infrastructure::observability::{MetricsCollector, StructuredLogger};

/// 僵死任务回收
///
/// 领取后进程崩溃的任务会一直停留在 `Processing`。
/// 超过阈值的执行中任务被放回 `Pending`，计数器保持不变。
pub struct StaleTaskReaper {
    store: Arc<dyn TaskStore>,
    timeout: Option<Duration>,
    metrics: MetricsCollector,
}

impl StaleTaskReaper {
    /// `timeout_seconds` 为0时不回收
    pub fn new(store: Arc<dyn TaskStore>, timeout_seconds: u64) -> Self {
        let seconds = i64::try_from(timeout_seconds)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        let timeout = (seconds > 0).then(|| Duration::seconds(seconds));
        Self {
            store,
            timeout,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    #[instrument(skip(self))]
    pub async fn reap(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<i64>> {
        let Some(timeout) = self.timeout else {
            return Ok(Vec::new());
        };

        let stale_before = now
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reclaimed = self.store.reclaim_stale(stale_before, now).await?;
        if reclaimed.is_empty() {
            debug!("没有需要回收的执行中任务");
        } else {
            self.metrics.record_stale_reclaimed(reclaimed.len());
            StructuredLogger::log_stale_reclaimed(&reclaimed, stale_before);
        }
        Ok(reclaimed)
    }
}
