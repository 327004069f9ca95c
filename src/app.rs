use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use scheduler_api::create_app;
use scheduler_core::{AppConfig, Channel, TriggerReport, TriggerService};
use scheduler_dispatcher::ScheduleEngine;
use scheduler_infrastructure::{install_prometheus_recorder, DatabaseManager};
use scheduler_worker::build_transport_registry;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{info, warn};

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 启动HTTP触发接口，等待外部调度器调用
    Serve,
    /// 执行一次触发，等待执行池排空后退出
    TriggerOnce {
        channel: Option<Channel>,
        limit: Option<i64>,
        task_id: Option<i64>,
    },
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    engine: Arc<ScheduleEngine>,
    metrics: Option<PrometheusHandle>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = DatabaseManager::connect(&config.database)
            .await
            .context("连接任务存储失败")?;
        info!("任务存储类型: {:?}", database.database_type());

        let registry = build_transport_registry(&config).context("初始化传输通道失败")?;
        info!("已注册传输通道: {:?}", registry.channels());

        let metrics = if config.observability.metrics_enabled {
            Some(install_prometheus_recorder().context("安装Prometheus指标导出器失败")?)
        } else {
            None
        };

        let engine = Arc::new(ScheduleEngine::new(
            database.task_store(),
            registry,
            &config.engine,
            &config.retry,
        ));

        Ok(Self {
            config,
            engine,
            metrics,
        })
    }

    pub async fn run(&self, mode: AppMode, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", mode);
        match mode {
            AppMode::Serve => self.run_api(shutdown_rx).await?,
            AppMode::TriggerOnce {
                channel,
                limit,
                task_id,
            } => {
                let report = self.trigger_once(channel, limit, task_id).await;
                let summary = self.engine.shutdown().await;
                let report = report?;
                info!(
                    claimed = report.claimed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    not_recorded = summary.not_recorded,
                    "单次触发执行完成"
                );
            }
        }
        Ok(())
    }

    async fn trigger_once(
        &self,
        channel: Option<Channel>,
        limit: Option<i64>,
        task_id: Option<i64>,
    ) -> Result<TriggerReport> {
        let report = match task_id {
            Some(id) => self.engine.trigger_task(id).await,
            None => self.engine.trigger_due(channel, limit).await,
        };
        report.context("触发执行失败")
    }

    async fn run_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if !self.config.api.enabled {
            return Err(anyhow::anyhow!("API服务被禁用，请检查配置"));
        }

        let trigger: Arc<dyn TriggerService> = self.engine.clone();
        let app = create_app(trigger, self.metrics.clone(), &self.config.api);

        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", self.config.api.bind_address);

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await
            .context("API服务器运行失败")?;

        let summary = self.engine.shutdown().await;
        if summary.not_recorded > 0 {
            warn!(
                not_recorded = summary.not_recorded,
                "部分执行结果未能写回，任务将由超时回收处理"
            );
        }
        info!(
            dispatched = summary.dispatched,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "API服务器已停止"
        );
        Ok(())
    }
}
