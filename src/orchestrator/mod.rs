//! Turn orchestration: route, load history, run the agent, persist both
//! halves of the turn, and hand the reply back complete or streamed.

mod reply;

pub use reply::{Reply, ReplyStream};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::agents::{AgentError, AgentHandle, AgentRegistry, FragmentStream, HandlerOutput};
use crate::config::Config;
use crate::providers::{ChatMessage, Provider};
use crate::routing::{KeywordRouter, MatchedBy, Router};
use crate::sessions::{Message, Role, SessionStores, StoreBackend};
use reply::{AssistantSlot, Deadline};

const DEFAULT_CONTEXT_WINDOW: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The agent could not be resolved or built. Nothing was recorded.
    #[error(transparent)]
    AgentLoad(#[from] AgentError),
    /// The user message could not be written. The agent was not invoked.
    #[error("failed to record user message: {0:#}")]
    Persistence(anyhow::Error),
    /// The turn task ended without handing back a reply.
    #[error("agent turn was interrupted")]
    Interrupted,
}

/// One inbound query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub session_id: String,
    /// Caller's agent choice. Must name a registered agent when set.
    pub agent_name: Option<String>,
    pub stream: bool,
}

#[derive(Debug)]
pub struct QueryOutcome {
    /// The agent that handled the turn.
    pub agent: String,
    pub session_id: String,
    pub matched_by: MatchedBy,
    pub reply: Reply,
}

/// Public view of an agent for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub model: String,
}

pub struct Orchestrator {
    router: Arc<dyn Router>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionStores>,
    context_window: usize,
    handler_timeout: Option<Duration>,
    prune_keep_recent: Option<usize>,
}

impl Orchestrator {
    pub fn new(
        router: Arc<dyn Router>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionStores>,
    ) -> Self {
        Self {
            router,
            registry,
            sessions,
            context_window: DEFAULT_CONTEXT_WINDOW,
            handler_timeout: None,
            prune_keep_recent: None,
        }
    }

    /// Wire up the built-in agents, keyword router and session stores from config.
    pub fn from_config(config: &Config, provider: Arc<dyn Provider>) -> anyhow::Result<Self> {
        let registry = Arc::new(AgentRegistry::with_builtin_agents(config, provider));
        let router = Arc::new(KeywordRouter::new(
            registry.routes(),
            &config.agents.default_agent,
            config.agents.command_prefix,
        )?);
        let sessions = Arc::new(SessionStores::new(StoreBackend::from_config(
            &config.memory,
            &config.workspace_dir,
        )));

        Ok(Self::new(router, registry, sessions)
            .with_context_window(config.memory.context_window)
            .with_handler_timeout(config.agents.handler_timeout_secs.map(Duration::from_secs))
            .with_prune_keep_recent(config.memory.prune_keep_recent))
    }

    pub fn with_context_window(mut self, messages: usize) -> Self {
        self.context_window = messages;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_prune_keep_recent(mut self, keep: Option<usize>) -> Self {
        self.prune_keep_recent = keep;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStores {
        &self.sessions
    }

    /// Run one turn.
    ///
    /// Agent errors at invocation time never surface as `Err`: they become
    /// an `"I encountered an error: ..."` reply that is also persisted.
    pub async fn handle_query(
        &self,
        request: QueryRequest,
    ) -> Result<QueryOutcome, OrchestratorError> {
        let QueryRequest {
            query,
            session_id,
            agent_name,
            stream,
        } = request;

        let explicit = agent_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        if let Some(name) = explicit {
            if !self.registry.contains(name) {
                tracing::warn!(agent = name, session_id = %session_id, "Requested agent is not registered");
                return Err(AgentError::NotFound(name.to_string()).into());
            }
        }

        let decision = self.router.route(&query, explicit);
        tracing::info!(
            agent = %decision.agent,
            session_id = %session_id,
            matched_by = %decision.matched_by,
            stream,
            "Routed query"
        );

        let handle = self.registry.load(&decision.agent).await.map_err(|e| {
            tracing::error!(agent = %decision.agent, error = %e, "Agent failed to load");
            e
        })?;

        let store = self
            .sessions
            .for_agent(&decision.agent)
            .map_err(OrchestratorError::Persistence)?;
        let context: Vec<ChatMessage> = store
            .load_context(&session_id, self.context_window)
            .await
            .into_iter()
            .map(to_chat_message)
            .collect();

        store
            .save_message(&session_id, Role::User, &query)
            .await
            .map_err(OrchestratorError::Persistence)?;

        let slot = AssistantSlot {
            store,
            agent: decision.agent.clone(),
            session_id: session_id.clone(),
            prune_keep_recent: self.prune_keep_recent,
        };
        let turn = Turn {
            handle,
            query,
            context,
            stream,
            deadline: self.handler_timeout.map(Deadline::starting_now),
        };

        // The turn runs detached so its assistant half is recorded even if
        // this future is dropped.
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(turn.run(slot, reply_tx));
        let reply = reply_rx.await.map_err(|_| OrchestratorError::Interrupted)?;

        Ok(QueryOutcome {
            agent: decision.agent,
            session_id,
            matched_by: decision.matched_by,
            reply,
        })
    }

    /// Every agent that loads, in registration order.
    pub async fn list_available_agents(&self) -> Vec<AgentSummary> {
        self.registry
            .list()
            .await
            .into_iter()
            .map(|record| AgentSummary {
                name: record.name,
                description: record.description,
                model: record.model,
            })
            .collect()
    }

    /// `None` for unknown agents and agents that fail to load.
    pub async fn agent_info(&self, name: &str) -> Option<AgentSummary> {
        match self.registry.get(name).await {
            Ok(record) => Some(AgentSummary {
                name: record.name,
                description: record.description,
                model: record.model,
            }),
            Err(AgentError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!(agent = name, error = %e, "Agent failed to load");
                None
            }
        }
    }

    /// Stored history for one agent's session, oldest first.
    pub async fn history(
        &self,
        agent: &str,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let store = self.store_for(agent)?;
        Ok(store.load_context(session_id, limit).await)
    }

    pub async fn clear_session(&self, agent: &str, session_id: &str) -> anyhow::Result<()> {
        self.store_for(agent)?.clear_session(session_id).await
    }

    pub async fn prune_session(
        &self,
        agent: &str,
        session_id: &str,
        keep_recent: usize,
    ) -> anyhow::Result<usize> {
        self.store_for(agent)?
            .prune(session_id, keep_recent)
            .await
    }

    fn store_for(&self, agent: &str) -> anyhow::Result<Arc<dyn crate::sessions::SessionStore>> {
        if !self.registry.contains(agent) {
            anyhow::bail!(AgentError::NotFound(agent.to_string()));
        }
        self.sessions.for_agent(agent)
    }
}

fn to_chat_message(message: Message) -> ChatMessage {
    ChatMessage {
        role: message.role.as_str().to_string(),
        content: message.content,
    }
}

async fn invoke(
    handle: &AgentHandle,
    query: &str,
    context: &[ChatMessage],
    stream: bool,
    deadline: Option<Deadline>,
) -> anyhow::Result<HandlerOutput> {
    let run = handle.handler.run(query, context, stream);
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at(), run)
            .await
            .map_err(|_| deadline.error())?,
        None => run.await,
    }
}

/// What the handler produced, before it is recorded.
enum Produced {
    Text(String),
    Fragments(FragmentStream),
}

/// One handler invocation, owned by its own task.
struct Turn {
    handle: AgentHandle,
    query: String,
    context: Vec<ChatMessage>,
    stream: bool,
    deadline: Option<Deadline>,
}

impl Turn {
    async fn run(self, slot: AssistantSlot, mut reply_tx: oneshot::Sender<Reply>) {
        let mut partial = String::new();
        let produced = tokio::select! {
            biased;
            () = reply_tx.closed() => None,
            produced = self.produce(&slot, &mut partial) => Some(produced),
        };

        let reply = match produced {
            None => {
                tracing::info!(
                    agent = %slot.agent,
                    session_id = %slot.session_id,
                    "Caller left before the reply; recording what was produced"
                );
                slot.fill(&partial).await;
                return;
            }
            Some(Produced::Fragments(fragments)) => {
                Reply::Stream(reply::relay(slot, fragments, self.deadline))
            }
            Some(Produced::Text(text)) => {
                slot.fill(&text).await;
                Reply::Complete(text)
            }
        };
        // A stream that nobody receives is dropped here, which the relay
        // treats as a cancelled reply.
        let _ = reply_tx.send(reply);
    }

    async fn produce(&self, slot: &AssistantSlot, partial: &mut String) -> Produced {
        match invoke(
            &self.handle,
            &self.query,
            &self.context,
            self.stream,
            self.deadline,
        )
        .await
        {
            Ok(HandlerOutput::Stream(fragments)) if self.stream => Produced::Fragments(fragments),
            Ok(HandlerOutput::Stream(fragments)) => {
                reply::collect(fragments, self.deadline, &slot.agent, partial).await;
                Produced::Text(std::mem::take(partial))
            }
            Ok(HandlerOutput::Complete(text)) => Produced::Text(text),
            Err(e) => {
                tracing::warn!(
                    agent = %slot.agent,
                    session_id = %slot.session_id,
                    error = %format!("{e:#}"),
                    "Agent failed"
                );
                Produced::Text(reply::error_reply(&e))
            }
        }
    }
}
