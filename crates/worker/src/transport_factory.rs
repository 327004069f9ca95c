use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use scheduler_core::{AppConfig, TransportRegistry};

use crate::transports::{FtpTransport, HttpTransport, MailTransport};

/// 根据配置创建全部通道的传输实现
pub fn build_transport_registry(config: &AppConfig) -> anyhow::Result<TransportRegistry> {
    let http = HttpTransport::new(config.http.clone()).context("创建HTTP传输失败")?;

    let registry = TransportRegistry::new()
        .with(Arc::new(http))
        .with(Arc::new(MailTransport::new(config.mail.clone())))
        .with(Arc::new(FtpTransport::new(config.ftp.clone())));

    info!(channels = ?registry.channels(), "传输通道初始化完成");
    Ok(registry)
}
