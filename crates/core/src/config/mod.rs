pub mod api_observability;
pub mod app_config;
pub mod channels;
pub mod database;
pub mod engine;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use channels::{FtpConfig, HttpConfig, SmtpDefaults};
pub use database::DatabaseConfig;
pub use engine::{EngineConfig, RetryConfig};
