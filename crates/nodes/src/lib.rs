//! `nodes` crate: the capabilities behind DAG nodes.
//!
//! Automatic nodes delegate to a [`Tool`] looked up by name in a
//! [`ToolRegistry`]; human nodes may carry an AI hint produced by a
//! [`SuggestionProvider`]. The engine crate dispatches through these trait
//! objects and never depends on concrete tool implementations.

pub mod builtin;
pub mod error;
pub mod traits;
pub mod mock;

pub use builtin::{ToolRegistry, DEFAULT_TOOL};
pub use error::ToolError;
pub use traits::{NoSuggestions, SuggestionContext, SuggestionProvider, Tool, ToolContext};
