//! 各通道的传输实现
//!
//! 每个传输自行负责超时和单次执行内的瞬时错误重试，
//! 所有失败都以 `ExecutionResult` 返回，不向分发器抛出错误。

pub mod transport_factory;
pub mod transports;

pub use transport_factory::build_transport_registry;
pub use transports::{FtpTransport, HttpTransport, MailTransport};
