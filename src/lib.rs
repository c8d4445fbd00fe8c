//! Parley - agent chat backend for OpenAI-compatible LLM APIs
//!
//! Agents own conversations, conversations own messages, and every user
//! message is answered by replaying the stored history to the model.

pub mod adapters;
pub mod chat;
pub mod config;
pub mod error;
pub mod store;
pub mod ui;

pub use error::{Error, Result};
