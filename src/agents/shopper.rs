use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write as _;

use super::llm::LlmAgent;
use super::traits::{AgentHandler, HandlerOutput};
use crate::providers::ChatMessage;

pub const NAME: &str = "shopper";

pub const DESCRIPTION: &str = "Finds products, compares prices and makes shopping recommendations";

pub const KEYWORDS: [&str; 7] = ["buy", "shop", "product", "price", "amazon", "search", "find"];

pub const MAX_OUTPUT_TOKENS: u32 = 800;

pub const SYSTEM_PROMPT: &str = "You are a helpful shopping assistant.";

/// One product listing returned by [`search_products`].
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub name: String,
    pub price: &'static str,
    pub rating: &'static str,
    pub features: &'static str,
}

const TIERS: [(&str, &str, &str, &str); 3] = [
    (
        "Premium Model",
        "$199.99",
        "4.5/5",
        "High quality, fast shipping, top-rated",
    ),
    (
        "Budget Option",
        "$79.99",
        "4.0/5",
        "Good value, reliable, popular choice",
    ),
    (
        "Professional Grade",
        "$349.99",
        "4.8/5",
        "Premium build, warranty included, best seller",
    ),
];

/// Mock catalogue search: three fixed tiers named after the query.
pub fn search_products(query: &str) -> Vec<Product> {
    TIERS
        .iter()
        .map(|&(tier, price, rating, features)| Product {
            name: format!("{query} - {tier}"),
            price,
            rating,
            features,
        })
        .collect()
}

/// Render search results as the plain-text block handed to the model.
pub fn format_results(query: &str, products: &[Product]) -> String {
    let mut out = format!("Top {} results for '{query}':\n\n", products.len());
    for (i, product) in products.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, product.name);
        let _ = writeln!(out, "   Price: {}", product.price);
        let _ = writeln!(out, "   Rating: {}", product.rating);
        let _ = writeln!(out, "   Features: {}\n", product.features);
    }
    out
}

/// Shopping agent: runs the product search first and grounds the reply in its results.
pub struct Shopper {
    llm: LlmAgent,
    system_prompt: String,
}

impl Shopper {
    pub fn new(llm: LlmAgent, system_prompt: String) -> Self {
        Self { llm, system_prompt }
    }

    fn grounded_prompt(&self, query: &str) -> String {
        let results = format_results(query, &search_products(query));
        format!(
            "{}\n\nHere are some product results I found:\n\n{results}\n\
             Based on these results and the user's query, provide helpful shopping advice, \
             compare options, and make recommendations. Be friendly and concise.",
            self.system_prompt.trim_end()
        )
    }
}

#[async_trait]
impl AgentHandler for Shopper {
    async fn run(
        &self,
        query: &str,
        context: &[ChatMessage],
        stream: bool,
    ) -> Result<HandlerOutput> {
        let prompt = self.grounded_prompt(query);
        tracing::debug!(agent = NAME, "Product search complete");
        self.llm.respond(&prompt, query, context, stream).await
    }

    fn name(&self) -> &str {
        &self.llm.record().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_returns_three_tiers_named_after_query() {
        let products = search_products("standing desk");
        assert_eq!(products.len(), 3);
        assert_eq!(products[0].name, "standing desk - Premium Model");
        assert_eq!(products[1].price, "$79.99");
        assert_eq!(products[2].rating, "4.8/5");
    }

    #[test]
    fn formatted_results_list_every_product() {
        let text = format_results("mouse", &search_products("mouse"));
        assert!(text.starts_with("Top 3 results for 'mouse':\n\n"));
        assert!(text.contains("1. mouse - Premium Model\n   Price: $199.99\n"));
        assert!(text.contains("3. mouse - Professional Grade"));
        assert!(text.contains("   Features: Good value, reliable, popular choice\n"));
    }
}
