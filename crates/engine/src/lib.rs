//! `engine` crate: flow definitions, the DAG compiler, node execution, the
//! task state machine, cron scheduling, notifications and analytics.

pub mod analytics;
pub mod config;
pub mod cron;
pub mod dag;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod flows;
pub mod models;
pub mod scheduler;
pub mod task_engine;
pub mod versions;

pub use analytics::Analytics;
pub use config::EngineConfig;
pub use cron::CronExpr;
pub use dag::{compile, CompiledDag};
pub use dispatcher::{Dispatcher, NotificationChannel};
pub use error::{EngineError, FlowValidationError};
pub use executor::{AssigneeResolver, RoleMap};
pub use flows::{FlowStore, FlowSummary};
pub use models::*;
pub use scheduler::Scheduler;
pub use task_engine::{TaskEngine, TaskQuery};
pub use versions::{VersionDiff, VersionManager};

use db::DbPool;

/// Every engine service over one pool.
#[derive(Clone)]
pub struct Engine {
    pub flows: FlowStore,
    pub versions: VersionManager,
    pub tasks: TaskEngine,
    pub analytics: Analytics,
    pub notifications: Dispatcher,
}

impl Engine {
    /// Default engine: built-in tools, log-only notifications.
    pub fn new(pool: DbPool) -> Self {
        Self::with_tasks(TaskEngine::builder(pool).build())
    }

    /// Wrap a task engine assembled by the caller.
    pub fn with_tasks(tasks: TaskEngine) -> Self {
        let pool = tasks.pool().clone();
        Self {
            flows: FlowStore::new(pool.clone()),
            versions: VersionManager::new(pool.clone()),
            notifications: tasks.dispatcher().clone(),
            analytics: Analytics::new(pool),
            tasks,
        }
    }

    /// A scheduler that triggers through this engine's task engine.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.tasks.clone())
    }
}
