//! Tool-level error type.

use thiserror::Error;

/// Errors returned by a tool's `invoke` method.
///
/// The engine never retries: either variant fails the step, and with it the
/// whole task. The variant only shapes the error payload stored on the step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The tool ran and reported a failure.
    #[error("tool failed: {0}")]
    Failed(String),

    /// The node's parameters were unusable for this tool.
    #[error("invalid tool parameters: {0}")]
    InvalidParams(String),
}

impl ToolError {
    /// Short machine-readable tag stored alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::InvalidParams(_) => "invalid_params",
        }
    }
}
