//! Keyword and slash-command router.

use anyhow::{bail, Result};

use super::traits::{AgentRoute, MatchedBy, RouteDecision, Router};

/// Routes by explicit choice, then `/<agent>` prefix, then keyword hits,
/// falling back to a configurable default agent.
pub struct KeywordRouter {
    /// Registration order; ties in keyword scoring go to the earlier entry.
    routes: Vec<AgentRoute>,
    default_agent: String,
    command_prefix: char,
}

impl KeywordRouter {
    pub fn new(routes: Vec<AgentRoute>, default_agent: &str, command_prefix: char) -> Result<Self> {
        if routes.is_empty() {
            bail!("router needs at least one registered agent");
        }

        let routes: Vec<AgentRoute> = routes
            .into_iter()
            .map(|route| AgentRoute {
                keywords: route
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
                name: route.name,
            })
            .collect();

        let default_agent = if routes.iter().any(|r| r.name == default_agent) {
            default_agent.to_string()
        } else {
            let fallback = routes[0].name.clone();
            tracing::warn!(
                configured = default_agent,
                fallback = %fallback,
                "Default agent is not registered; using the first registered agent"
            );
            fallback
        };

        Ok(Self {
            routes,
            default_agent,
            command_prefix,
        })
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    fn slash_target(&self, query: &str) -> Option<&str> {
        if !query.starts_with(self.command_prefix) {
            return None;
        }
        let token = query.split_whitespace().next()?;
        let name = token.strip_prefix(self.command_prefix)?;
        self.routes
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.name.as_str())
    }

    fn best_keyword_match(&self, query: &str) -> Option<(&str, usize)> {
        let lowered = query.to_lowercase();
        let mut best: Option<(&str, usize)> = None;
        for route in &self.routes {
            let score = route
                .keywords
                .iter()
                .filter(|k| lowered.contains(k.as_str()))
                .count();
            if score > best.map_or(0, |(_, s)| s) {
                best = Some((route.name.as_str(), score));
            }
        }
        best
    }
}

impl Router for KeywordRouter {
    fn route(&self, query: &str, explicit: Option<&str>) -> RouteDecision {
        if let Some(name) = explicit {
            if self.knows(name) {
                return RouteDecision {
                    agent: name.to_string(),
                    matched_by: MatchedBy::Explicit,
                };
            }
            tracing::debug!(agent = name, "Explicit agent is not registered; routing by content");
        }

        if let Some(name) = self.slash_target(query) {
            return RouteDecision {
                agent: name.to_string(),
                matched_by: MatchedBy::SlashCommand,
            };
        }

        if let Some((name, score)) = self.best_keyword_match(query) {
            return RouteDecision {
                agent: name.to_string(),
                matched_by: MatchedBy::Keywords { score },
            };
        }

        RouteDecision {
            agent: self.default_agent.clone(),
            matched_by: MatchedBy::Default,
        }
    }

    fn knows(&self, name: &str) -> bool {
        self.routes.iter().any(|r| r.name == name)
    }

    fn name(&self) -> &str {
        "keyword"
    }
}
