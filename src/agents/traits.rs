//! Agent handler traits and output types.

use async_trait::async_trait;
use anyhow::Result;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::providers::ChatMessage;

/// Reply fragments in arrival order. An `Err` item ends the reply early.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// What a handler produced for one query.
pub enum HandlerOutput {
    Complete(String),
    Stream(FragmentStream),
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Static description of an agent, as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub description: String,
    pub model: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

/// Answers queries for one agent.
///
/// Handlers never touch session storage: history arrives in `context`
/// (oldest first) and the caller persists whatever the handler returns.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Produce a reply. `stream` asks for incremental fragments; a handler
    /// may still answer with `Complete` and the caller copes.
    async fn run(&self, query: &str, context: &[ChatMessage], stream: bool)
        -> Result<HandlerOutput>;

    fn name(&self) -> &str;
}
