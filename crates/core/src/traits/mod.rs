pub mod repository;
pub mod transport;
pub mod trigger;

pub use repository::TaskStore;
pub use transport::Transport;
pub use trigger::{TriggerReport, TriggerService};
