//! Web search capability and the Brave Search API client
use super::generator::{check_status, http_client};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub description: String,
}

/// Result of one search. Failures are reported in-band with `success = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchOutcome {
    pub success: bool,
    pub query: String,
    pub results: Vec<SearchHit>,
    pub message: Option<String>,
}

impl SearchOutcome {
    pub fn found(query: impl Into<String>, results: Vec<SearchHit>) -> Self {
        Self { success: true, query: query.into(), results, message: None }
    }

    pub fn failed(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self { success: false, query: query.into(), results: Vec::new(), message: Some(message.into()) }
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, count: u32) -> anyhow::Result<SearchOutcome>;
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

pub struct BraveSearchClient {
    api_key: Option<String>,
    api_url: String,
    http_client: reqwest::Client,
}

impl BraveSearchClient {
    pub fn new(api_key: Option<String>, api_url: impl Into<String>, timeout: Duration) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!("BRAVE_SEARCH_API_KEY is not set; web searches will report failure");
        }
        let api_url = api_url.into();
        info!("Brave search client initialized: {}", api_url);
        Self { api_key, api_url, http_client: http_client(timeout) }
    }
}

#[async_trait]
impl WebSearch for BraveSearchClient {
    async fn search(&self, query: &str, count: u32) -> anyhow::Result<SearchOutcome> {
        let Some(api_key) = &self.api_key else {
            return Ok(SearchOutcome::failed(query, "Brave Search APIキーが設定されていません。"));
        };

        debug!("Brave search: q={:?} count={}", query, count);
        let response = self.http_client
            .get(&self.api_url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .query(&[("q", query.to_string()), ("count", count.to_string())])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Brave search request failed: {}", e))?;

        let response = match check_status(response, "Brave Search").await {
            Ok(response) => response,
            Err(e) => {
                error!("{}", e);
                return Ok(SearchOutcome::failed(query, format!("Brave Search APIエラー: {}", e)));
            }
        };

        let body: BraveResponse = response.json().await
            .map_err(|e| anyhow::anyhow!("Failed to parse Brave response: {}", e))?;
        let results: Vec<SearchHit> = body
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchHit { title: r.title, url: r.url, description: r.description })
            .collect();

        info!("Search succeeded for {:?}: {} results", query, results.len());
        Ok(SearchOutcome::found(query, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_missing_key_fails_in_band() {
        let client = BraveSearchClient::new(None, "http://127.0.0.1:1", Duration::from_secs(1));
        let outcome = client.search("rust", 5).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("Brave Search APIキーが設定されていません。"));
    }

    #[tokio::test]
    async fn test_search_parses_web_results() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_header("X-Subscription-Token", "key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "rust async".into()),
                Matcher::UrlEncoded("count".into(), "3".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"web":{"results":[{"title":"Tokio","url":"https://tokio.rs","description":"runtime"}]}}"#)
            .create_async()
            .await;

        let client = BraveSearchClient::new(Some("key".into()), format!("{}/search", server.url()), Duration::from_secs(5));
        let outcome = client.search("rust async", 3).await.unwrap();
        mock.assert_async().await;
        assert!(outcome.success);
        assert_eq!(outcome.results, vec![SearchHit {
            title: "Tokio".into(),
            url: "https://tokio.rs".into(),
            description: "runtime".into(),
        }]);
    }

    #[tokio::test]
    async fn test_http_error_is_in_band() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/search").match_query(Matcher::Any).with_status(429).create_async().await;

        let client = BraveSearchClient::new(Some("key".into()), format!("{}/search", server.url()), Duration::from_secs(5));
        let outcome = client.search("q", 5).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("429"));
    }

    #[tokio::test]
    async fn test_missing_web_section_is_empty() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/search").match_query(Matcher::Any).with_status(200).with_body("{}").create_async().await;

        let client = BraveSearchClient::new(Some("key".into()), format!("{}/search", server.url()), Duration::from_secs(5));
        let outcome = client.search("q", 5).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.results.is_empty());
    }
}
