//! `MockTool`: a test double for [`Tool`].
//!
//! Useful in unit and integration tests where a real tool implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{SuggestionContext, SuggestionProvider, Tool, ToolContext, ToolError};

/// Behaviour injected into `MockTool` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value (merged with `{"node": <label>}`).
    ReturnValue(Value),
    /// Fail with the given message.
    Fail(String),
    /// Sleep, then return the value.
    Delayed(Duration, Value),
}

/// A mock tool that records every call it receives and returns a
/// programmer-specified result.
pub struct MockTool {
    /// What the tool will do when `invoke` is called.
    pub behaviour: MockBehaviour,
    /// `(node_id, params)` for every call, in call order.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockTool {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::with(MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock that succeeds after `delay`.
    pub fn delayed(delay: Duration, value: Value) -> Self {
        Self::with(MockBehaviour::Delayed(delay, value))
    }

    fn with(behaviour: MockBehaviour) -> Self {
        Self { behaviour, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Number of times this tool has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Node ids this tool was invoked for, in call order.
    pub fn called_nodes(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(node, _)| node.clone()).collect()
    }
}

fn tagged(label: &str, v: &Value) -> Value {
    // Merge the node label with the configured output so tests can trace
    // which step produced what.
    let mut out = json!({ "node": label });
    if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
        for (k, val) in v_obj {
            out_obj.insert(k.clone(), val.clone());
        }
    }
    out
}

#[async_trait]
impl Tool for MockTool {
    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push((ctx.node_id.clone(), params));

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(tagged(&ctx.label, v)),
            MockBehaviour::Fail(msg) => Err(ToolError::Failed(msg.clone())),
            MockBehaviour::Delayed(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(tagged(&ctx.label, v))
            }
        }
    }
}

/// Suggestion provider that answers with a fixed string and records the
/// labels it was asked about.
pub struct MockSuggestions {
    pub answer: String,
    pub asked: Arc<Mutex<Vec<String>>>,
}

impl MockSuggestions {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self { answer: answer.into(), asked: Arc::new(Mutex::new(Vec::new())) }
    }
}

#[async_trait]
impl SuggestionProvider for MockSuggestions {
    async fn suggest(&self, ctx: &SuggestionContext) -> Option<String> {
        self.asked.lock().unwrap().push(ctx.label.clone());
        Some(self.answer.clone())
    }
}
