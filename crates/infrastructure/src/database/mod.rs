pub mod manager;
pub mod mapping;
pub mod postgres;
pub mod sqlite;

pub use manager::{mask_database_url, DatabaseManager, DatabaseType};
pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;
