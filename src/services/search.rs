//! Web search and encyclopedia lookups.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{key, ProviderError, ProviderResult};

// ---

const BRAVE_API: &str = "https://api.search.brave.com/res/v1/web/search";
const WIKIPEDIA_API: &str = "https://en.wikipedia.org/w/api.php";
const WIKIPEDIA_SUMMARY: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";

/// Number of articles summarized per encyclopedia lookup.
const WIKIPEDIA_RESULTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleSummary {
    pub title: String,
    pub summary: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> ProviderResult<Vec<SearchResult>>;
}

#[async_trait]
pub trait Encyclopedia: Send + Sync {
    async fn lookup(&self, query: &str) -> ProviderResult<Vec<ArticleSummary>>;
}

// ---

pub struct BraveSearch {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl BraveSearch {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }
}

#[derive(Deserialize)]
struct BraveResult {
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Deserialize)]
struct BraveResponse {
    web: Option<BraveWeb>,
}

#[async_trait]
impl WebSearch for BraveSearch {
    async fn search(&self, query: &str) -> ProviderResult<Vec<SearchResult>> {
        // ---
        let api_key = key(&self.api_key, "web search", "BRAVE_KEY")?;

        let response: BraveResponse = self
            .http
            .get(BRAVE_API)
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json")
            .query(&[("q", query)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchResult {
                title: r.title,
                snippet: r.description,
            })
            .collect())
    }
}

// ---

pub struct Wikipedia {
    http: reqwest::Client,
}

impl Wikipedia {
    // ---
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn summary(&self, title: &str) -> ProviderResult<ArticleSummary> {
        // ---
        let summary: PageSummary = self
            .http
            .get(summary_url(title)?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(ArticleSummary {
            title: summary.title,
            summary: summary.extract,
        })
    }
}

fn summary_url(title: &str) -> ProviderResult<Url> {
    // ---
    let mut url = Url::parse(WIKIPEDIA_SUMMARY)
        .map_err(|e| ProviderError::Unavailable(format!("bad summary endpoint: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ProviderError::Unavailable("summary endpoint cannot take a path".to_string()))?
        .push(&title.replace(' ', "_"));
    Ok(url)
}

#[derive(Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchResponse {
    query: SearchQuery,
}

#[derive(Deserialize)]
struct PageSummary {
    title: String,
    #[serde(default)]
    extract: String,
}

#[async_trait]
impl Encyclopedia for Wikipedia {
    async fn lookup(&self, query: &str) -> ProviderResult<Vec<ArticleSummary>> {
        // ---
        let limit = WIKIPEDIA_RESULTS.to_string();
        let response: SearchResponse = self
            .http
            .get(WIKIPEDIA_API)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("format", "json"),
                ("srsearch", query),
                ("srlimit", limit.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let summaries = join_all(
            response
                .query
                .search
                .iter()
                .map(|hit| self.summary(&hit.title)),
        )
        .await;

        summaries.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn summary_titles_are_path_encoded() {
        // ---
        let url = summary_url("Rust (programming language)").unwrap();
        assert_eq!(
            url.as_str(),
            "https://en.wikipedia.org/api/rest_v1/page/summary/Rust_(programming_language)"
        );

        let url = summary_url("AC/DC").unwrap();
        assert!(url.as_str().ends_with("/AC%2FDC"));
    }
}
