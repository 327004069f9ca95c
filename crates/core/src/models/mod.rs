pub mod execution;
pub mod payload;
pub mod task;

pub use execution::{
    ExceptionContext, ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord,
    ExecutionMetadata, ExecutionResult,
};
pub use payload::{
    FileProtocol, FtpPayload, HttpPayload, MailBodyType, MailPayload, TaskPayload,
};
pub use task::{Channel, ExecutionStatus, ScheduleTask, TaskFilter};
