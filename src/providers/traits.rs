use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A single message in a conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Complete a conversation and return the full reply text.
    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> anyhow::Result<String>;

    /// Complete a conversation, forwarding each text delta through `tx` as it
    /// arrives. Returns the concatenated reply. Stops early once `tx` is closed.
    ///
    /// Default: one non-streamed call whose reply is sent as a single delta.
    async fn stream_chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<String> {
        let reply = self
            .chat_with_history(messages, model, temperature, max_tokens)
            .await?;
        let _ = tx.send(reply.clone());
        Ok(reply)
    }

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Provider for Echo {
        async fn chat_with_history(
            &self,
            messages: &[ChatMessage],
            _model: &str,
            _temperature: f64,
            _max_tokens: Option<u32>,
        ) -> anyhow::Result<String> {
            Ok(messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[test]
    fn chat_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").content, "a");
    }

    #[tokio::test]
    async fn default_stream_sends_single_delta() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = Echo
            .stream_chat_with_history(&[ChatMessage::user("hi")], "m", 0.7, None, tx)
            .await
            .unwrap();

        assert_eq!(reply, "hi");
        assert_eq!(rx.recv().await.as_deref(), Some("hi"));
        assert!(rx.recv().await.is_none());
    }
}
