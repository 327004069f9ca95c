pub mod execute;
pub mod health;
pub mod metrics;
