//! Package search against the npm registry.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const NPM_REGISTRY_URL: &str = "https://registry.npmjs.org";

/// Scope all official MCP server packages are published under.
const PACKAGE_PREFIX: &str = "@modelcontextprotocol/server-";

/// One package returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Last publish date as reported by the registry
    pub date: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    objects: Vec<SearchObject>,
}

#[derive(Debug, Deserialize)]
struct SearchObject {
    package: NpmPackage,
}

#[derive(Debug, Deserialize)]
struct NpmPackage {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<NpmAuthor>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NpmAuthor {
    name: Option<String>,
}

impl From<NpmPackage> for SearchResult {
    fn from(package: NpmPackage) -> Self {
        Self {
            name: package.name,
            version: package.version,
            description: package.description.unwrap_or_default(),
            author: package
                .author
                .and_then(|a| a.name)
                .unwrap_or_else(|| "Unknown".to_string()),
            date: package.date.unwrap_or_default(),
        }
    }
}

/// Client for the registry search endpoint.
pub struct RegistrySearch {
    client: reqwest::Client,
    base_url: String,
}

impl RegistrySearch {
    pub fn new() -> Self {
        Self::with_base_url(NPM_REGISTRY_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Search URL for `query`, which may be a bare name or a full package name.
    pub fn search_url(&self, query: &str, limit: usize) -> Result<reqwest::Url> {
        let query = query.trim();
        let query = query.strip_prefix(PACKAGE_PREFIX).unwrap_or(query);
        let text = format!("{}{}", PACKAGE_PREFIX, query);

        reqwest::Url::parse_with_params(
            &format!("{}/-/v1/search", self.base_url),
            &[("text", text), ("size", limit.to_string())],
        )
        .map_err(|e| Error::Validation(format!("invalid registry URL '{}': {}", self.base_url, e)))
    }

    /// Find MCP server packages matching `query`.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let url = self.search_url(query, limit)?;
        debug!("Searching {}", url);

        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let body: SearchResponse = response.json().await?;
        Ok(parse_results(body))
    }
}

impl Default for RegistrySearch {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_results(body: SearchResponse) -> Vec<SearchResult> {
    body.objects
        .into_iter()
        .map(|object| object.package.into())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_url_prefixes_query() {
        let search = RegistrySearch::with_base_url("https://registry.example.com/");
        let url = search.search_url("github", 5).unwrap();
        assert_eq!(
            url.as_str(),
            "https://registry.example.com/-/v1/search?text=%40modelcontextprotocol%2Fserver-github&size=5"
        );

        let full = search
            .search_url("@modelcontextprotocol/server-github", 5)
            .unwrap();
        assert_eq!(full, url);
    }

    #[test]
    fn test_parse_results_fills_defaults() {
        let body: SearchResponse = serde_json::from_str(
            r#"{
                "objects": [
                    {"package": {
                        "name": "@modelcontextprotocol/server-github",
                        "version": "0.6.2",
                        "description": "GitHub MCP server",
                        "author": {"name": "Anthropic"},
                        "date": "2024-12-01T00:00:00.000Z"
                    }},
                    {"package": {"name": "@modelcontextprotocol/server-bare", "version": "0.1.0"}}
                ],
                "total": 2
            }"#,
        )
        .unwrap();

        let results = parse_results(body);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].author, "Anthropic");
        assert_eq!(results[0].date, "2024-12-01T00:00:00.000Z");
        assert_eq!(results[1].author, "Unknown");
        assert_eq!(results[1].description, "");
    }
}
