//! Shared completion plumbing for provider-backed agents.

use anyhow::Result;
use futures_util::stream;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::traits::{AgentRecord, FragmentStream, HandlerOutput};
use crate::providers::{ChatMessage, Provider};

/// Sends `[system, ...context, user]` to a provider with the agent's model settings.
pub struct LlmAgent {
    record: AgentRecord,
    provider: Arc<dyn Provider>,
}

impl LlmAgent {
    pub fn new(record: AgentRecord, provider: Arc<dyn Provider>) -> Self {
        Self { record, provider }
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub async fn respond(
        &self,
        system_prompt: &str,
        query: &str,
        context: &[ChatMessage],
        stream: bool,
    ) -> Result<HandlerOutput> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(context);
        messages.push(ChatMessage::user(query));

        if stream {
            return Ok(HandlerOutput::Stream(provider_stream(
                Arc::clone(&self.provider),
                messages,
                self.record.model.clone(),
                self.record.temperature,
                Some(self.record.max_output_tokens),
            )));
        }

        let reply = self
            .provider
            .chat_with_history(
                &messages,
                &self.record.model,
                self.record.temperature,
                Some(self.record.max_output_tokens),
            )
            .await?;
        Ok(HandlerOutput::Complete(reply))
    }
}

/// Run a streamed completion on its own task and expose its deltas as a
/// [`FragmentStream`]. A provider failure surfaces as the final item.
///
/// Dropping the stream closes the delta channel, which stops the provider read.
pub fn provider_stream(
    provider: Arc<dyn Provider>,
    messages: Vec<ChatMessage>,
    model: String,
    temperature: f64,
    max_tokens: Option<u32>,
) -> FragmentStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let call = tokio::spawn(async move {
        provider
            .stream_chat_with_history(&messages, &model, temperature, max_tokens, tx)
            .await
    });

    Box::pin(stream::unfold(
        (rx, Some(call)),
        |(mut rx, call)| async move {
            if let Some(fragment) = rx.recv().await {
                return Some((Ok(fragment), (rx, call)));
            }
            // Channel closed: the provider call has returned.
            match call?.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some((Err(e), (rx, None))),
                Err(join) => Some((
                    Err(anyhow::anyhow!("provider task failed: {join}")),
                    (rx, None),
                )),
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use parking_lot::Mutex;

    /// Streams its canned fragments, optionally failing afterwards.
    struct Scripted {
        fragments: Vec<&'static str>,
        fail_after: bool,
        seen: Mutex<Vec<ChatMessage>>,
    }

    impl Scripted {
        fn new(fragments: Vec<&'static str>, fail_after: bool) -> Arc<Self> {
            Arc::new(Self {
                fragments,
                fail_after,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        async fn chat_with_history(
            &self,
            messages: &[ChatMessage],
            _model: &str,
            _temperature: f64,
            _max_tokens: Option<u32>,
        ) -> Result<String> {
            *self.seen.lock() = messages.to_vec();
            Ok(self.fragments.concat())
        }

        async fn stream_chat_with_history(
            &self,
            messages: &[ChatMessage],
            _model: &str,
            _temperature: f64,
            _max_tokens: Option<u32>,
            tx: mpsc::UnboundedSender<String>,
        ) -> Result<String> {
            *self.seen.lock() = messages.to_vec();
            for fragment in &self.fragments {
                let _ = tx.send((*fragment).to_string());
            }
            if self.fail_after {
                anyhow::bail!("connection reset");
            }
            Ok(self.fragments.concat())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn record() -> AgentRecord {
        AgentRecord {
            name: "paper_writer".into(),
            description: "writes".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_output_tokens: 1000,
        }
    }

    #[tokio::test]
    async fn complete_reply_wraps_context_between_system_and_query() {
        let provider = Scripted::new(vec!["Hello", " world"], false);
        let agent = LlmAgent::new(record(), provider.clone());
        let context = [ChatMessage::user("earlier"), ChatMessage::assistant("reply")];

        let output = agent.respond("sys", "now", &context, false).await.unwrap();
        assert!(matches!(output, HandlerOutput::Complete(ref t) if t == "Hello world"));

        let seen = provider.seen.lock().clone();
        let roles: Vec<&str> = seen.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(seen[0].content, "sys");
        assert_eq!(seen[3].content, "now");
    }

    #[tokio::test]
    async fn stream_yields_fragments_in_order() {
        let agent = LlmAgent::new(record(), Scripted::new(vec!["a", "b", "c"], false));
        let HandlerOutput::Stream(stream) = agent.respond("sys", "q", &[], true).await.unwrap()
        else {
            panic!("expected a stream");
        };

        let items: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn provider_failure_is_last_item() {
        let stream = provider_stream(
            Scripted::new(vec!["partial"], true),
            vec![ChatMessage::user("q")],
            "m".into(),
            0.7,
            None,
        );
        let items: Vec<Result<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(items[1]
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("connection reset"));
    }
}
