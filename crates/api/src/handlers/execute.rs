//! 触发接口
//!
//! 两个接口都只负责领取，领取完成后立即返回 202；
//! 单个任务的执行结果只能通过任务自身的状态和历史查看。

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use scheduler_core::Channel;

use crate::{
    error::{ApiError, ApiResult},
    response::accepted,
    routes::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct TriggerDueQuery {
    pub channel: Option<String>,
    pub limit: Option<i64>,
}

impl TriggerDueQuery {
    fn parse(&self) -> ApiResult<(Option<Channel>, Option<i64>)> {
        let channel = self
            .channel
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.parse::<Channel>())
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        if let Some(limit) = self.limit {
            if limit <= 0 {
                return Err(ApiError::BadRequest("limit 必须大于0".to_string()));
            }
        }
        Ok((channel, self.limit))
    }
}

/// POST /api/execute/trigger-due
pub async fn trigger_due(
    State(state): State<AppState>,
    Query(query): Query<TriggerDueQuery>,
) -> ApiResult<impl IntoResponse> {
    let (channel, limit) = query.parse()?;
    let report = state.trigger.trigger_due(channel, limit).await?;

    info!(claimed = report.claimed, channel = ?channel, "到期任务触发完成");
    let message = format!("已领取{}个任务，正在后台执行", report.claimed);
    Ok(accepted(report, message))
}

/// POST /api/execute/tasks/{id}
pub async fn trigger_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let report = state.trigger.trigger_task(task_id).await?;

    let message = if report.claimed == 0 {
        format!("任务 {task_id} 正在执行中，本次触发未领取")
    } else {
        format!("任务 {task_id} 已领取，正在后台执行")
    };
    Ok(accepted(report, message))
}
