//! Read-only aggregates over tasks and steps.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::Serialize;

use db::models::{StepTimingRow, TaskFilter};
use db::repository::{steps, tasks};
use db::DbPool;

use crate::error::EngineError;
use crate::models::{convert_all, StepKind, StepStatus, Task, TaskStatus};

const MAX_DAYS: i64 = 365;
const TOP_BOTTLENECKS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub completed: i64,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trend {
    pub days: i64,
    pub points: Vec<TrendPoint>,
    pub total_completed: i64,
    pub total_created: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottleneck {
    pub step_name: String,
    pub total_executions: usize,
    pub avg_duration_sec: f64,
    pub max_duration_sec: f64,
    pub avg_duration_label: String,
    pub max_duration_label: String,
    /// Mean duration as a percentage of the slowest step's mean.
    pub pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottlenecks {
    pub days: i64,
    pub bottlenecks: Vec<Bottleneck>,
    pub avg_human_step_sec: Option<f64>,
    pub avg_human_step_label: Option<String>,
}

#[derive(Clone)]
pub struct Analytics {
    pool: DbPool,
}

impl Analytics {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Completed and created tasks per local day over the last `days` days,
    /// today included.
    pub async fn trend(&self, days: i64, flow_name: Option<&str>) -> Result<Trend, EngineError> {
        check_days(days)?;
        let all: Vec<Task> = convert_all(tasks::list_tasks(&self.pool, &TaskFilter::default()).await?)?;
        Ok(compute_trend(&all, days, Local::now().date_naive(), flow_name))
    }

    /// Slowest successful steps by label over the last `days` days.
    pub async fn bottlenecks(&self, days: i64, flow_name: Option<&str>) -> Result<Bottlenecks, EngineError> {
        check_days(days)?;
        let since = Utc::now() - Duration::days(days);
        let timings = steps::list_step_timings(&self.pool).await?;
        let bottlenecks = compute_bottlenecks(&timings, since, flow_name);
        let avg_human = mean_human_step_secs(&timings, since, flow_name);
        Ok(Bottlenecks {
            days,
            bottlenecks,
            avg_human_step_sec: avg_human,
            avg_human_step_label: avg_human.map(duration_label),
        })
    }

    /// Mean duration in seconds of finished human steps over the last `days` days.
    pub async fn avg_human_step_time(&self, days: i64, flow_name: Option<&str>) -> Result<Option<f64>, EngineError> {
        check_days(days)?;
        let timings = steps::list_step_timings(&self.pool).await?;
        Ok(mean_human_step_secs(&timings, Utc::now() - Duration::days(days), flow_name))
    }

    /// Distinct flow names that have at least one task.
    pub async fn flow_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(tasks::list_flow_names(&self.pool).await?)
    }
}

fn check_days(days: i64) -> Result<(), EngineError> {
    if !(1..=MAX_DAYS).contains(&days) {
        return Err(EngineError::InvalidQuery(format!("days must be between 1 and {MAX_DAYS}, got {days}")));
    }
    Ok(())
}

fn local_date(t: &DateTime<Utc>) -> NaiveDate {
    t.with_timezone(&Local).date_naive()
}

/// Bucket `tasks` into the `days` local dates ending at `today`.
pub fn compute_trend(tasks: &[Task], days: i64, today: NaiveDate, flow_name: Option<&str>) -> Trend {
    let first = today - Duration::days(days - 1);
    let mut buckets: BTreeMap<NaiveDate, (i64, i64)> =
        first.iter_days().take(days as usize).map(|d| (d, (0, 0))).collect();

    for task in tasks.iter().filter(|t| flow_name.map_or(true, |name| t.flow_name == name)) {
        if let Some(bucket) = buckets.get_mut(&local_date(&task.created_at)) {
            bucket.1 += 1;
        }
        if task.status == TaskStatus::Completed {
            if let Some(bucket) = task.finished_at.as_ref().and_then(|f| buckets.get_mut(&local_date(f))) {
                bucket.0 += 1;
            }
        }
    }

    let points: Vec<TrendPoint> = buckets
        .into_iter()
        .map(|(date, (completed, created))| TrendPoint { date, completed, created })
        .collect();
    Trend {
        days,
        total_completed: points.iter().map(|p| p.completed).sum(),
        total_created: points.iter().map(|p| p.created).sum(),
        points,
    }
}

fn duration_secs(row: &StepTimingRow) -> Option<f64> {
    let finished = row.finished_at?;
    let ms = (finished - row.started_at).num_milliseconds();
    (ms > 0).then(|| ms as f64 / 1000.0)
}

fn in_scope(row: &StepTimingRow, since: DateTime<Utc>, flow_name: Option<&str>) -> bool {
    row.started_at >= since && flow_name.map_or(true, |name| row.flow_name == name)
}

fn is_success(row: &StepTimingRow) -> bool {
    row.status.parse::<StepStatus>().is_ok_and(|s| s.is_success())
}

/// Group successful, non-zero-duration steps by label and rank them by
/// mean duration.
pub fn compute_bottlenecks(rows: &[StepTimingRow], since: DateTime<Utc>, flow_name: Option<&str>) -> Vec<Bottleneck> {
    let mut by_label: HashMap<&str, Vec<f64>> = HashMap::new();
    for row in rows.iter().filter(|r| in_scope(r, since, flow_name) && is_success(r)) {
        if let Some(secs) = duration_secs(row) {
            by_label.entry(row.label.as_str()).or_default().push(secs);
        }
    }

    let mut ranked: Vec<(String, usize, f64, f64)> = by_label
        .into_iter()
        .map(|(label, durations)| {
            let avg = durations.iter().sum::<f64>() / durations.len() as f64;
            let max = durations.iter().copied().fold(0.0, f64::max);
            (label.to_string(), durations.len(), avg, max)
        })
        .collect();
    ranked.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_BOTTLENECKS);

    let slowest = ranked.first().map_or(0.0, |r| r.2);
    ranked
        .into_iter()
        .map(|(step_name, total_executions, avg, max)| Bottleneck {
            step_name,
            total_executions,
            avg_duration_sec: round1(avg),
            max_duration_sec: round1(max),
            avg_duration_label: duration_label(avg),
            max_duration_label: duration_label(max),
            pct: if slowest > 0.0 { round1(avg / slowest * 100.0) } else { 0.0 },
        })
        .collect()
}

fn mean_human_step_secs(rows: &[StepTimingRow], since: DateTime<Utc>, flow_name: Option<&str>) -> Option<f64> {
    let durations: Vec<f64> = rows
        .iter()
        .filter(|r| r.kind == StepKind::Human.as_str() && in_scope(r, since, flow_name))
        .filter_map(duration_secs)
        .collect();
    if durations.is_empty() {
        return None;
    }
    Some(round1(durations.iter().sum::<f64>() / durations.len() as f64))
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Short human-readable duration: `42s`, `7m`, `3.5h`.
pub fn duration_label(secs: f64) -> String {
    if secs < 60.0 {
        format!("{}s", secs.round() as i64)
    } else if secs < 3600.0 {
        format!("{}m", (secs / 60.0).round() as i64)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}
