use anyhow::Result;
use async_trait::async_trait;

use super::llm::LlmAgent;
use super::traits::{AgentHandler, HandlerOutput};
use crate::providers::ChatMessage;

pub const NAME: &str = "paper_writer";

pub const DESCRIPTION: &str = "Writes academic papers, essays and research-style content";

pub const KEYWORDS: [&str; 6] = ["write", "academic", "paper", "research", "essay", "paragraph"];

pub const MAX_OUTPUT_TOKENS: u32 = 1000;

pub const SYSTEM_PROMPT: &str = "You are an academic writing assistant. \
Write clear, well-structured prose in a formal register: state the thesis early, \
support claims with reasoning and evidence, and organise longer answers into \
paragraphs with a short introduction and conclusion. When the user asks for a \
specific format (abstract, outline, single paragraph), follow it exactly.";

/// Academic writing agent: a system prompt in front of the conversation.
pub struct PaperWriter {
    llm: LlmAgent,
    system_prompt: String,
}

impl PaperWriter {
    pub fn new(llm: LlmAgent, system_prompt: String) -> Self {
        Self { llm, system_prompt }
    }
}

#[async_trait]
impl AgentHandler for PaperWriter {
    async fn run(
        &self,
        query: &str,
        context: &[ChatMessage],
        stream: bool,
    ) -> Result<HandlerOutput> {
        self.llm
            .respond(&self.system_prompt, query, context, stream)
            .await
    }

    fn name(&self) -> &str {
        &self.llm.record().name
    }
}
