use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use scheduler_core::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 支持标准5段表达式（分 时 日 月 周，周日为0或7）以及带秒的6/7段表达式。
/// 5段表达式补齐秒字段为0，并把星期数字换算为解析库使用的 1(周日)..7(周六)。
/// 所有计算都在UTC下进行。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expr: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize_expression(cron_expr)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(cron_expr, e))?;

        Ok(Self {
            expr: cron_expr.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// 严格晚于 `base` 的下一次执行时间
    pub fn next_after(&self, base: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
        self.schedule
            .after(&base)
            .find(|t| *t > base)
            .ok_or_else(|| SchedulerError::InvalidExpression {
                expr: self.expr.clone(),
                message: "表达式没有后续的触发时间".to_string(),
            })
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// `next(expr, base)`：解析并计算严格晚于 `base` 的下一次执行时间
pub fn next_execution_time(
    cron_expr: &str,
    base: DateTime<Utc>,
) -> SchedulerResult<DateTime<Utc>> {
    CronScheduler::new(cron_expr)?.next_after(base)
}

fn invalid(expr: &str, message: impl ToString) -> SchedulerError {
    SchedulerError::InvalidExpression {
        expr: expr.to_string(),
        message: message.to_string(),
    }
}

fn normalize_expression(cron_expr: &str) -> SchedulerResult<String> {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = normalize_day_of_week(fields[4]).ok_or_else(|| {
                invalid(cron_expr, format!("无效的星期字段: {}", fields[4]))
            })?;
            let normalized = format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            );
            debug!("标准CRON表达式 '{}' 转换为 '{}'", cron_expr, normalized);
            Ok(normalized)
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(invalid(cron_expr, format!("字段数量应为5、6或7，实际为{n}"))),
    }
}

/// 标准星期编号 0..7（0与7均为周日）换算为 1..7（1为周日）
fn normalize_day_of_week(field: &str) -> Option<String> {
    let parts = field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let mapped = match range.split_once('-') {
                Some((start, end)) => map_range(start, end)?,
                None => map_day(range)?,
            };
            Some(match step {
                Some(step) => format!("{mapped}/{step}"),
                None => mapped,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(","))
}

fn map_day(day: &str) -> Option<String> {
    match day.parse::<u32>() {
        Ok(n @ 0..=7) => Some(((n % 7) + 1).to_string()),
        Ok(_) => None,
        // `*`、`?` 和英文缩写保持原样
        Err(_) => Some(day.to_string()),
    }
}

fn map_range(start: &str, end: &str) -> Option<String> {
    match (start.parse::<u32>(), end.parse::<u32>()) {
        (Ok(a @ 0..=7), Ok(7)) if a > 0 => Some(format!("{}-7,1", a + 1)),
        (Ok(a @ 0..=6), Ok(b @ 0..=6)) if a <= b => Some(format!("{}-{}", a + 1, b + 1)),
        (Err(_), Err(_)) => Some(format!("{start}-{end}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_five_minute_expression_from_mid_interval() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 3, 0).unwrap();
        let next = next_execution_time("*/5 * * * *", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_next_is_strictly_after_base() {
        let on_boundary = Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap();
        let next = next_execution_time("*/5 * * * *", on_boundary).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap());

        let scheduler = CronScheduler::new("0 0 * * * *").unwrap();
        let mut base = Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap();
        for _ in 0..50 {
            let next = scheduler.next_after(base).unwrap();
            assert!(next > base);
            base = next;
        }
    }

    #[test]
    fn test_standard_weekday_numbers() {
        // 2024-01-06 是周六
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap();

        let next = next_execution_time("0 9 * * 1-5", saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);

        let next = next_execution_time("30 8 * * 0", saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);

        let next = next_execution_time("0 12 * * 5-7", saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Sat);
        assert_eq!(next.day(), 6);
    }

    #[test]
    fn test_six_field_expression_passes_through() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = next_execution_time("30 0 0 * * *", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap());
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in ["", "not a cron", "* * *", "61 * * * *", "0 9 * * 9"] {
            let err = CronScheduler::validate_cron_expression(expr).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidExpression { .. }),
                "{expr} should be invalid"
            );
        }
    }

    #[test]
    fn test_upcoming_times() {
        let scheduler = CronScheduler::new("0 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let times = scheduler.upcoming_times(base, 3);
        assert_eq!(times.len(), 3);
        assert_eq!(times[0], Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
        assert_eq!(scheduler.expression(), "0 * * * *");
    }
}
