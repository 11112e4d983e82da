//! Reply delivery: the single-reader relay between a handler's fragment
//! stream, the caller and the session log.

use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::agents::FragmentStream;
use crate::providers::sanitize_api_error;
use crate::sessions::{Role, SessionStore};

/// What the caller receives for one turn.
pub enum Reply {
    Complete(String),
    Stream(ReplyStream),
}

impl Reply {
    /// The whole reply text, draining the stream if there is one.
    pub async fn into_text(self) -> String {
        match self {
            Self::Complete(text) => text,
            Self::Stream(stream) => stream.collect_text().await,
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Reply fragments relayed from the handler. The stream ends only after the
/// assistant message has been written. Dropping it cancels the turn; the
/// content relayed so far is still persisted.
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ReplyStream {
    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(fragment) = self.rx.recv().await {
            text.push_str(&fragment);
        }
        text
    }
}

impl Stream for ReplyStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

/// Absolute cutoff for one handler invocation, stream included.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
    after: Duration,
}

impl Deadline {
    pub(crate) fn starting_now(after: Duration) -> Self {
        Self {
            at: Instant::now() + after,
            after,
        }
    }

    pub(crate) fn at(self) -> Instant {
        self.at
    }

    pub(crate) fn error(self) -> anyhow::Error {
        anyhow::anyhow!("agent did not finish within {}s", self.after.as_secs_f64())
    }
}

/// Text persisted and shown when a handler fails.
pub(crate) fn error_reply(error: &anyhow::Error) -> String {
    format!(
        "I encountered an error: {}",
        sanitize_api_error(&format!("{error:#}"))
    )
}

/// The assistant half of a turn, written exactly once.
pub(crate) struct AssistantSlot {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) agent: String,
    pub(crate) session_id: String,
    pub(crate) prune_keep_recent: Option<usize>,
}

impl AssistantSlot {
    /// Write the assistant message, then apply retention. Failures are logged only.
    pub(crate) async fn fill(self, content: &str) {
        if let Err(e) = self
            .store
            .save_message(&self.session_id, Role::Assistant, content)
            .await
        {
            tracing::error!(
                agent = %self.agent,
                session_id = %self.session_id,
                error = %format!("{e:#}"),
                "Failed to persist assistant message"
            );
            return;
        }

        if let Some(keep) = self.prune_keep_recent {
            match self.store.prune(&self.session_id, keep).await {
                Ok(0) => {}
                Ok(deleted) => tracing::debug!(
                    agent = %self.agent,
                    session_id = %self.session_id,
                    deleted,
                    "Pruned session history"
                ),
                Err(e) => tracing::warn!(
                    agent = %self.agent,
                    session_id = %self.session_id,
                    error = %format!("{e:#}"),
                    "Failed to prune session history"
                ),
            }
        }
    }
}

pub(crate) async fn next_fragment(
    fragments: &mut FragmentStream,
    deadline: Option<Deadline>,
) -> Option<anyhow::Result<String>> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline.at(), fragments.next()).await {
            Ok(item) => item,
            Err(_) => Some(Err(deadline.error())),
        },
        None => fragments.next().await,
    }
}

/// Append the error notice to whatever was produced so far. Returns the
/// fragment that was appended.
pub(crate) fn append_error(full: &mut String, error: &anyhow::Error) -> String {
    let notice = error_reply(error);
    let fragment = if full.is_empty() {
        notice
    } else {
        format!("\n\n{notice}")
    };
    full.push_str(&fragment);
    fragment
}

/// Drain a fragment stream into `full` (non-streaming callers). Text read
/// so far stays in `full` if this future is dropped early.
pub(crate) async fn collect(
    mut fragments: FragmentStream,
    deadline: Option<Deadline>,
    agent: &str,
    full: &mut String,
) {
    while let Some(item) = next_fragment(&mut fragments, deadline).await {
        match item {
            Ok(fragment) => full.push_str(&fragment),
            Err(e) => {
                tracing::warn!(agent, error = %format!("{e:#}"), "Agent failed mid-reply");
                append_error(full, &e);
                break;
            }
        }
    }
}

/// Spawn the relay task and hand back the caller's end.
pub(crate) fn relay(
    slot: AssistantSlot,
    mut fragments: FragmentStream,
    deadline: Option<Deadline>,
) -> ReplyStream {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut full = String::new();
        loop {
            tokio::select! {
                biased;
                () = tx.closed() => {
                    tracing::info!(
                        agent = %slot.agent,
                        session_id = %slot.session_id,
                        relayed = full.len(),
                        "Reply stream dropped by caller; persisting partial reply"
                    );
                    break;
                }
                item = next_fragment(&mut fragments, deadline) => match item {
                    Some(Ok(fragment)) => {
                        full.push_str(&fragment);
                        if tx.send(fragment).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            agent = %slot.agent,
                            session_id = %slot.session_id,
                            error = %format!("{e:#}"),
                            "Agent failed mid-stream"
                        );
                        let fragment = append_error(&mut full, &e);
                        let _ = tx.send(fragment);
                        break;
                    }
                    None => break,
                },
            }
        }
        // Stop reading before the write so the provider can wind down.
        drop(fragments);
        slot.fill(&full).await;
        drop(tx);
    });

    ReplyStream { rx }
}
