//! Cron scheduler.
//!
//! A single background loop. Each tick loads the cron flows, and every flow
//! due in the current local minute claims that minute in the database
//! before a task is triggered, so two schedulers sharing a database start
//! at most one task per flow and minute.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use db::repository::flows;
use db::DbPool;

use crate::cron::CronExpr;
use crate::error::EngineError;
use crate::models::{convert_all, Flow, Task, TriggerSource};
use crate::task_engine::TaskEngine;

pub struct Scheduler {
    pool: DbPool,
    engine: TaskEngine,
    /// Parsed expressions by flow id, re-parsed when the source changes.
    cache: Mutex<HashMap<i64, (String, CronExpr)>>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: TaskEngine) -> Self {
        Self {
            pool: engine.pool().clone(),
            tick_interval: engine.config().tick_interval,
            engine,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate every cron flow against the current minute.
    pub async fn tick(&self) -> Result<Vec<Task>, EngineError> {
        self.tick_at(Utc::now()).await
    }

    /// Evaluate every cron flow against the minute containing `now`.
    ///
    /// Returns the tasks started by this tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<Task>, EngineError> {
        let local = now.with_timezone(&Local).naive_local();
        let minute = local.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(local);
        let slot = now.timestamp() - now.timestamp().rem_euclid(60);

        let due: Vec<Flow> = convert_all(flows::list_cron_flows(&self.pool).await?)?;
        let due: Vec<Flow> = {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.retain(|id, _| due.iter().any(|f| f.id == *id));
            due.into_iter()
                .filter(|flow| {
                    let Some(source) = flow.trigger_config.as_deref() else {
                        return false;
                    };
                    let fresh = cache.get(&flow.id).is_some_and(|(cached, _)| cached == source);
                    if !fresh {
                        match CronExpr::parse(source) {
                            Ok(expr) => {
                                cache.insert(flow.id, (source.to_string(), expr));
                            }
                            Err(e) => {
                                warn!(flow_id = flow.id, "skipping invalid cron '{source}': {e}");
                                cache.remove(&flow.id);
                                return false;
                            }
                        }
                    }
                    cache.get(&flow.id).is_some_and(|(_, expr)| expr.matches(&minute))
                })
                .collect()
        };

        let mut started = Vec::new();
        for flow in due {
            if !flows::claim_schedule_slot(&self.pool, flow.id, slot).await? {
                debug!(flow_id = flow.id, slot, "slot already claimed");
                continue;
            }
            match self.engine.trigger(flow.id, TriggerSource::Scheduled).await {
                Ok(task) => {
                    info!(flow_id = flow.id, task_id = task.id, "scheduled run started");
                    started.push(task);
                }
                Err(e) => error!(flow_id = flow.id, "scheduled run could not start: {e}"),
            }
        }
        Ok(started)
    }

    /// Tick forever at the configured interval.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(every = ?self.tick_interval, "scheduler started");
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!("scheduler tick failed: {e}");
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
