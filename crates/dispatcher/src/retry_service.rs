use chrono::{DateTime, Duration, Utc};
use scheduler_core::{config::RetryConfig, ScheduleTask};

/// 失败后的重试决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 在重试预算内，按重试间隔提前再次执行
    Retry {
        attempt: i32,
        max_retries: i32,
        next_execute_time: DateTime<Utc>,
    },
    /// 预算耗尽，回到CRON的正常节奏（一次性任务为空）
    Exhausted {
        max_retries: i32,
        next_execute_time: Option<DateTime<Utc>>,
    },
}

impl RetryDecision {
    pub fn next_execute_time(&self) -> Option<DateTime<Utc>> {
        match self {
            RetryDecision::Retry {
                next_execute_time, ..
            } => Some(*next_execute_time),
            RetryDecision::Exhausted {
                next_execute_time, ..
            } => *next_execute_time,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// 引擎级重试协调器
///
/// 与传输层内部的重试相互独立：传输层在一次尝试内重试瞬时I/O错误，
/// 这里决定整次尝试失败之后下一次什么时候再来。
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    config: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries_for(&self, task: &ScheduleTask) -> i32 {
        task.max_retries
            .unwrap_or(self.config.default_max_retries)
            .max(0)
    }

    pub fn retry_interval_for(&self, task: &ScheduleTask) -> Duration {
        let seconds = task
            .retry_interval_seconds
            .filter(|s| *s > 0)
            .unwrap_or(self.config.default_retry_interval_seconds);
        Duration::seconds(seconds.max(1))
    }

    /// `cron_next` 是CRON求值器基于失败时间算出的正常下一次时间
    ///
    /// 重试时间必须早于 `cron_next`：间隔不短于CRON周期时，重试落在CRON触发前一秒。
    pub fn decide(
        &self,
        task: &ScheduleTask,
        failed_at: DateTime<Utc>,
        cron_next: Option<DateTime<Utc>>,
    ) -> RetryDecision {
        let max_retries = self.max_retries_for(task);

        if task.current_retry_count < max_retries {
            RetryDecision::Retry {
                attempt: task.current_retry_count + 1,
                max_retries,
                next_execute_time: self.retry_time(task, failed_at, cron_next),
            }
        } else {
            RetryDecision::Exhausted {
                max_retries,
                next_execute_time: cron_next,
            }
        }
    }

    fn retry_time(
        &self,
        task: &ScheduleTask,
        failed_at: DateTime<Utc>,
        cron_next: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let by_interval = failed_at + self.retry_interval_for(task);
        match cron_next {
            Some(cron_next) if by_interval >= cron_next => {
                let before_cron = cron_next - Duration::seconds(1);
                // CRON下一次与失败时间相隔不足一秒时无法更早，只能与CRON同时
                if before_cron > failed_at {
                    before_cron
                } else {
                    cron_next
                }
            }
            _ => by_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scheduler_testing_utils::TaskBuilder;

    fn coordinator() -> RetryCoordinator {
        RetryCoordinator::new(RetryConfig {
            default_max_retries: 3,
            default_retry_interval_seconds: 60,
        })
    }

    #[test]
    fn test_retry_within_budget_uses_interval() {
        let task = TaskBuilder::new().with_current_retry_count(1).build();
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let cron_next = Some(Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap());

        let decision = coordinator().decide(&task, failed_at, cron_next);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                attempt: 2,
                max_retries: 3,
                next_execute_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap(),
            }
        );
        assert!(decision.next_execute_time() < cron_next);
    }

    #[test]
    fn test_retry_interval_longer_than_cron_period_stays_before_cron() {
        let task = TaskBuilder::new().with_retry_policy(3, 60).build();
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        let cron_next = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();

        let decision = coordinator().decide(&task, failed_at, Some(cron_next));
        let next = decision.next_execute_time().unwrap();
        assert!(decision.is_retry());
        assert!(next < cron_next);
        assert!(next > failed_at);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 59).unwrap());
    }

    #[test]
    fn test_retry_with_cron_within_one_second_uses_cron_time() {
        let task = TaskBuilder::new().build();
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 59).unwrap();
        let cron_next = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();

        let decision = coordinator().decide(&task, failed_at, Some(cron_next));
        assert_eq!(decision.next_execute_time(), Some(cron_next));
    }

    #[test]
    fn test_exhausted_falls_back_to_cron() {
        let task = TaskBuilder::new().with_current_retry_count(3).build();
        let failed_at = Utc::now();
        let cron_next = Some(failed_at + Duration::hours(1));

        let decision = coordinator().decide(&task, failed_at, cron_next);
        assert!(!decision.is_retry());
        assert_eq!(decision.next_execute_time(), cron_next);

        let one_shot = coordinator().decide(&task, failed_at, None);
        assert_eq!(one_shot.next_execute_time(), None);
    }

    #[test]
    fn test_task_overrides_defaults() {
        let task = TaskBuilder::new().with_retry_policy(1, 5).build();
        let failed_at = Utc::now();

        let decision = coordinator().decide(&task, failed_at, None);
        assert_eq!(
            decision.next_execute_time(),
            Some(failed_at + Duration::seconds(5))
        );

        let task = TaskBuilder::new()
            .with_retry_policy(1, 5)
            .with_current_retry_count(1)
            .build();
        assert!(!coordinator().decide(&task, failed_at, None).is_retry());
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let task = TaskBuilder::new().with_retry_policy(0, 5).build();
        let decision = coordinator().decide(&task, Utc::now(), None);
        assert_eq!(
            decision,
            RetryDecision::Exhausted {
                max_retries: 0,
                next_execute_time: None
            }
        );
    }
}
