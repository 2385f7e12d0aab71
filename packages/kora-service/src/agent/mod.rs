//! Iterative tool-calling answers for agent mode.

pub mod config;
pub mod engine;
pub mod prompts;
pub mod tools;

pub use config::{AgentOverrides, AgentRunConfig};
pub use engine::{AgentEngine, AgentOutcome};
pub use tools::{AgentTool, ToolContext, ToolOutput, ToolRegistry};
