//! Query routing: resolves which agent answers a given query.

pub mod keyword;
pub mod traits;

pub use keyword::KeywordRouter;
pub use traits::{AgentRoute, MatchedBy, RouteDecision, Router};
