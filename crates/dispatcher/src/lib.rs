pub mod cron_utils;
pub mod dispatcher;
pub mod engine;
pub mod recorder;
pub mod recovery_service;
pub mod retry_service;
pub mod selector;

pub use cron_utils::{next_execution_time, CronScheduler};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use engine::{ExecutionPool, ScheduleEngine};
pub use recorder::ExecutionRecorder;
pub use recovery_service::StaleTaskReaper;
pub use retry_service::{RetryCoordinator, RetryDecision};
pub use selector::DueTaskSelector;
