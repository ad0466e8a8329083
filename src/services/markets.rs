//! Stock quotes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{key, ProviderResult};

// ---

const FINNHUB_API: &str = "https://finnhub.io/api/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockQuote {
    #[serde(alias = "c")]
    pub current: f64,
    #[serde(alias = "d")]
    pub change: Option<f64>,
    #[serde(alias = "dp")]
    pub percent_change: Option<f64>,
    #[serde(alias = "h")]
    pub high: f64,
    #[serde(alias = "l")]
    pub low: f64,
    #[serde(alias = "o")]
    pub open: f64,
    #[serde(alias = "pc")]
    pub previous_close: f64,
}

#[async_trait]
pub trait Markets: Send + Sync {
    async fn quote(&self, symbol: &str) -> ProviderResult<StockQuote>;
}

pub struct Finnhub {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl Finnhub {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }
}

#[async_trait]
impl Markets for Finnhub {
    async fn quote(&self, symbol: &str) -> ProviderResult<StockQuote> {
        // ---
        let api_key = key(&self.api_key, "markets", "FINNHUB_KEY")?;

        let quote = self
            .http
            .get(format!("{FINNHUB_API}/quote"))
            .query(&[("symbol", symbol), ("token", api_key)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(quote)
    }
}
