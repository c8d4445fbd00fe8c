//! Chat module — conversations with an LLM-backed agent.
//!
//! This module contains:
//! - Context assembly from stored history
//! - The OpenAI-compatible completion client with its retry policy
//! - The message pipeline that ties storage and the client together
//! - Agent and conversation management
//! - Token usage reporting

mod context;
mod messages;

pub mod agents;
pub mod conversations;
pub mod usage;

// Completion client in submodule
pub mod llm;

// Re-exports for convenience
pub use agents::AgentService;
pub use context::build_context;
pub use conversations::{ConversationService, ConversationSummary};
pub use llm::{ChatMessage, ChatOptions, ChatReply, LlmClient, Usage};
pub use messages::{Exchange, MessageService, Stage};
pub use usage::{ConversationUsage, UsageService};
