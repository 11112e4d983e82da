//! `/chat/ws`: streamed chat over a long-lived WebSocket.
//!
//! Every answered query gets a `start` frame, then `token`s and `end`, or a
//! closing `error` when the turn could not run.
//!
//! Exchanges on one socket run one at a time. Queries that arrive while a
//! reply is streaming are queued and answered afterwards. A client that
//! disconnects mid-reply cancels it; the orchestrator keeps what was sent.

use std::collections::VecDeque;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};

use super::api::resolve_session_id;
use super::protocol::{JsonProtocol, Protocol, ServerFrame};
use super::AppState;
use crate::agents::AgentError;
use crate::orchestrator::{OrchestratorError, QueryRequest, Reply};

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Whether the socket is still usable after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Open,
    Closed,
}

/// GET /chat/ws: upgrade to a chat socket
pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let protocol = JsonProtocol;
    let (mut sender, mut receiver) = socket.split();
    let mut queued: VecDeque<String> = VecDeque::new();
    tracing::debug!("Chat socket opened");

    loop {
        let text = match queued.pop_front() {
            Some(text) => text,
            None => match receiver.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Chat socket read failed");
                    break;
                }
            },
        };

        let connection = exchange(
            &state,
            &protocol,
            &text,
            &mut sender,
            &mut receiver,
            &mut queued,
        )
        .await;
        if connection == Connection::Closed {
            break;
        }
    }

    tracing::debug!("Chat socket closed");
}

/// Answer one client message.
async fn exchange(
    state: &AppState,
    protocol: &dyn Protocol,
    text: &str,
    sender: &mut WsSender,
    receiver: &mut WsReceiver,
    queued: &mut VecDeque<String>,
) -> Connection {
    let message = match protocol.decode(text) {
        Ok(message) => message,
        Err(e) => {
            let frame = ServerFrame::Error {
                content: format!("invalid message: {e}"),
            };
            return send_frame(sender, protocol, &frame).await;
        }
    };

    let Some(query) = message.query.filter(|q| !q.trim().is_empty()) else {
        let frame = ServerFrame::Error {
            content: "no query provided".into(),
        };
        return send_frame(sender, protocol, &frame).await;
    };

    let request = QueryRequest {
        query,
        session_id: resolve_session_id(message.session_id),
        agent_name: message.agent_name,
        stream: true,
    };
    let session_id = request.session_id.clone();
    let requested = request.agent_name.clone();
    let outcome = match state.orchestrator.handle_query(request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Streamed chat request failed");
            let start = ServerFrame::Start {
                session_id,
                agent: failed_agent(&e, requested),
            };
            if send_frame(sender, protocol, &start).await == Connection::Closed {
                return Connection::Closed;
            }
            let frame = ServerFrame::Error {
                content: e.to_string(),
            };
            return send_frame(sender, protocol, &frame).await;
        }
    };

    let start = ServerFrame::Start {
        session_id: outcome.session_id.clone(),
        agent: outcome.agent.clone(),
    };
    if send_frame(sender, protocol, &start).await == Connection::Closed {
        return Connection::Closed;
    }

    match outcome.reply {
        Reply::Complete(content) => {
            if !content.is_empty() {
                let frame = ServerFrame::Token { content };
                if send_frame(sender, protocol, &frame).await == Connection::Closed {
                    return Connection::Closed;
                }
            }
        }
        Reply::Stream(mut stream) => loop {
            tokio::select! {
                fragment = stream.next() => {
                    let Some(content) = fragment else { break };
                    let frame = ServerFrame::Token { content };
                    if send_frame(sender, protocol, &frame).await == Connection::Closed {
                        return Connection::Closed;
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => queued.push_back(text.as_str().to_owned()),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        tracing::info!(
                            agent = %outcome.agent,
                            session_id = %outcome.session_id,
                            "Client left mid-reply; cancelling stream"
                        );
                        return Connection::Closed;
                    }
                    Some(Ok(_)) => {}
                },
            }
        },
    }

    let end = ServerFrame::End {
        session_id: outcome.session_id,
    };
    send_frame(sender, protocol, &end).await
}

/// The agent named in a failed exchange's `start` frame.
fn failed_agent(error: &OrchestratorError, requested: Option<String>) -> String {
    match error {
        OrchestratorError::AgentLoad(AgentError::NotFound(name) | AgentError::Load { name, .. }) => {
            name.clone()
        }
        _ => requested.unwrap_or_default(),
    }
}

async fn send_frame(
    sender: &mut WsSender,
    protocol: &dyn Protocol,
    frame: &ServerFrame,
) -> Connection {
    let text = match protocol.encode(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode frame");
            return Connection::Open;
        }
    };
    match sender.send(Message::Text(text.into())).await {
        Ok(()) => Connection::Open,
        Err(e) => {
            tracing::debug!(error = %e, "Chat socket write failed");
            Connection::Closed
        }
    }
}
