//! LLM access for subquery planning, clarification, and synthesis.

mod client;
mod types;

pub use client::{ChatCompletionsClient, CompletionClient, LlmClientConfig};
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse};

#[cfg(test)]
pub(crate) use client::doubles::ScriptedCompletionClient;
