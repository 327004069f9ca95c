use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use scheduler_core::{AppConfig, Channel};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("schedule-engine")
        .version("1.0.0")
        .about("定时任务执行引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/schedule-engine.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["serve", "trigger"])
                .default_value("serve"),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .value_name("CHANNEL")
                .help("只触发指定通道的任务 (trigger模式)")
                .value_parser(["http", "mail", "ftp"]),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .value_name("N")
                .help("本次最多领取的任务数 (trigger模式)")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new("task-id")
                .long("task-id")
                .value_name("ID")
                .help("立即执行指定任务 (trigger模式)")
                .value_parser(clap::value_parser!(i64))
                .conflicts_with_all(["channel", "limit"]),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认>")))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    let mode = parse_app_mode(&matches)?;
    info!("启动定时任务执行引擎, 模式: {:?}", mode);

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(mode, shutdown_rx).await })
    };

    // 单次触发模式下应用会自行结束
    let finished = tokio::select! {
        result = &mut app_handle => Some(result),
        _ = wait_for_shutdown_signal() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(30), &mut app_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("应用关闭超时，强制退出");
                    return Ok(());
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => info!("定时任务执行引擎已退出"),
        Ok(Err(e)) => {
            error!("应用运行失败: {e:#}");
            return Err(e);
        }
        Err(e) => {
            error!("应用任务异常终止: {e}");
            return Err(e.into());
        }
    }
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        _ => return Err(anyhow::anyhow!("不支持的日志格式: {log_format}")),
    }

    Ok(())
}

fn parse_app_mode(matches: &ArgMatches) -> Result<AppMode> {
    let mode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("serve");
    match mode {
        "serve" => Ok(AppMode::Serve),
        "trigger" => {
            let channel = matches
                .get_one::<String>("channel")
                .map(|c| c.parse::<Channel>())
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(AppMode::TriggerOnce {
                channel,
                limit: matches.get_one::<i64>("limit").copied(),
                task_id: matches.get_one::<i64>("task-id").copied(),
            })
        }
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
    }
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
