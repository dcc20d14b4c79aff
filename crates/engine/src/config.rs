//! Engine tuning knobs.

use std::time::Duration;

/// Runtime configuration shared by the task engine and the scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the cron scheduler evaluates due flows.
    pub tick_interval: Duration,
    /// Assignee of human steps when neither the node nor the triggering
    /// user names one.
    pub default_assignee: String,
    /// Wait time after which a pending human step is reported as overdue,
    /// unless the node sets its own `timeout_hours`.
    pub human_step_timeout: Duration,
    /// Longest wait for the suggestion provider before a human step is
    /// opened without a hint.
    pub suggestion_timeout: Duration,
    /// Poll period of [`crate::TaskEngine::wait_until_settled`].
    pub settle_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            default_assignee: "manager".to_string(),
            human_step_timeout: Duration::from_secs(24 * 60 * 60),
            suggestion_timeout: Duration::from_secs(10),
            settle_poll_interval: Duration::from_millis(10),
        }
    }
}
