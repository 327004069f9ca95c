pub mod config;
pub mod errors;
pub mod models;
pub mod traits;
pub mod transport_registry;

pub use config::AppConfig;
pub use errors::*;
pub use models::{
    Channel, ExceptionContext, ExceptionRecord, ExecutionCommit, ExecutionHistoryRecord,
    ExecutionMetadata, ExecutionResult, ExecutionStatus, FtpPayload, HttpPayload, MailPayload,
    ScheduleTask, TaskFilter, TaskPayload,
};
pub use traits::{TaskStore, Transport, TriggerReport, TriggerService};
pub use transport_registry::TransportRegistry;
