//! Routing traits and types for choosing which agent answers a query.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a query was matched to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MatchedBy {
    /// The caller named a registered agent.
    Explicit,
    /// The query began with `/<agent>`.
    SlashCommand,
    /// Keyword scoring picked the agent with this many distinct hits.
    Keywords { score: usize },
    /// Nothing matched.
    Default,
}

impl fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("explicit"),
            Self::SlashCommand => f.write_str("slash_command"),
            Self::Keywords { score } => write!(f, "keywords({score})"),
            Self::Default => f.write_str("default"),
        }
    }
}

/// The outcome of routing a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub agent: String,
    pub matched_by: MatchedBy,
}

/// Keywords that steer queries toward one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRoute {
    pub name: String,
    pub keywords: Vec<String>,
}

impl AgentRoute {
    pub fn new<I, S>(name: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }
}

/// Maps a query to a registered agent name.
///
/// Routing is total: every query resolves to some registered agent.
pub trait Router: Send + Sync {
    /// Choose the agent for `query`. A registered `explicit` name always wins.
    fn route(&self, query: &str, explicit: Option<&str>) -> RouteDecision;

    /// Whether `name` is a registered agent.
    fn knows(&self, name: &str) -> bool;

    /// The name of this router implementation.
    fn name(&self) -> &str;
}
