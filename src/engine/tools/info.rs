//! Lookups: weather, markets and search.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::location::QueryArgs;
use super::{NoArgs, Tool, ToolContext, ToolError, ToolOutput};
use crate::services::completion::ToolDefinition;

// ---

fn query_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "description": description}
        },
        "required": ["query"]
    })
}

pub struct GetWeather;

#[async_trait]
impl Tool for GetWeather {
    type Args = NoArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_weather",
            description: "Get current conditions and today's forecast at the user's location \
                          (imperial units).",
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn run(&self, _: NoArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let report = ctx
            .services
            .weather
            .report(ctx.data.latitude, ctx.data.longitude)
            .await?;
        ToolOutput::json(&report)
    }
}

#[derive(Debug, Deserialize)]
pub struct SymbolArgs {
    pub symbol: String,
}

pub struct StockQuoteTool;

#[async_trait]
impl Tool for StockQuoteTool {
    type Args = SymbolArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "stock_quote",
            description: "Get the latest quote for a stock ticker symbol.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string", "description": "Ticker symbol, e.g. AAPL"}
                },
                "required": ["symbol"]
            }),
        }
    }

    async fn run(&self, args: SymbolArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let symbol = args.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(ToolError::Argument("symbol must not be empty".to_string()));
        }
        let quote = ctx.services.markets.quote(&symbol).await?;
        ToolOutput::json(&quote)
    }
}

pub struct SearchWeb;

#[async_trait]
impl Tool for SearchWeb {
    type Args = QueryArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_web",
            description: "Search the web for recent or factual information.",
            parameters: query_schema("Search query"),
        }
    }

    async fn run(&self, args: QueryArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let results = ctx.services.web.search(&args.query).await?;
        if results.is_empty() {
            return Err(ToolError::Execution(format!("No results for '{}'.", args.query)));
        }
        ToolOutput::json(&results)
    }
}

pub struct SearchWikipedia;

#[async_trait]
impl Tool for SearchWikipedia {
    type Args = QueryArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_wikipedia",
            description: "Look up encyclopedia summaries about a person, place or topic.",
            parameters: query_schema("Topic to look up"),
        }
    }

    async fn run(&self, args: QueryArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let articles = ctx.services.encyclopedia.lookup(&args.query).await?;
        if articles.is_empty() {
            return Err(ToolError::Execution(format!("No articles found for '{}'.", args.query)));
        }
        ToolOutput::json(&articles)
    }
}
