use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{config::DatabaseConfig, traits::TaskStore, SchedulerError, SchedulerResult};
use tracing::info;

use super::postgres::PostgresTaskStore;
use super::sqlite::SqliteTaskStore;

/// Database type detection
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// 根据连接串创建任务存储并完成建表
pub struct DatabaseManager {
    database_type: DatabaseType,
    store: Arc<dyn TaskStore>,
}

impl DatabaseManager {
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let database_type = DatabaseType::from_url(&config.url);
        info!("连接数据库: {}", mask_database_url(&config.url));

        let store: Arc<dyn TaskStore> = match database_type {
            DatabaseType::PostgreSQL => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                    .connect(&config.url)
                    .await
                    .map_err(SchedulerError::Database)?;
                let store = PostgresTaskStore::new(pool);
                store.run_migrations().await?;
                Arc::new(store)
            }
            DatabaseType::SQLite => {
                Arc::new(SqliteTaskStore::connect(&config.url, config.max_connections).await?)
            }
        };

        info!("数据库连接成功: {:?}", database_type);
        Ok(Self {
            database_type,
            store,
        })
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type.clone()
    }

    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }
}

/// 屏蔽数据库URL中的敏感信息
pub fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if url[colon_pos + 1..].starts_with("//") {
                return url.to_string();
            }
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
