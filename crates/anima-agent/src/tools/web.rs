//! Web tools: search and page fetch. Both are opaque to the core — the
//! model sees plain-text results, all failures come back as error results.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use anima_core::config::WebSearchConfig;

use super::{Tool, ToolCategory, ToolResult};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_QUERY_CHARS: usize = 400;
const MAX_RESULTS: usize = 5;
const MAX_FETCH_CHARS: usize = 20_000;

pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl WebSearchTool {
    pub fn new(config: &WebSearchConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns titles, URLs and snippets."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Web
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return ToolResult::error("search query must not be empty");
        }
        if self.api_key.is_empty() {
            return ToolResult::error("web search is not configured");
        }

        // Long queries get truncated rather than rejected.
        let query: String = query.chars().take(MAX_QUERY_CHARS).collect();

        let url = format!("{}/res/v1/web/search", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("q", query.as_str()), ("count", "5")])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "web search request failed");
                return ToolResult::error(format!("search request failed: {e}"));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return ToolResult::error(format!("search API returned status {status}"));
        }

        let parsed: SearchApiResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("could not parse search response: {e}")),
        };

        let results = parsed.web.map(|w| w.results).unwrap_or_default();
        if results.is_empty() {
            return ToolResult::ok("No results found.");
        }

        let mut out = String::new();
        for (i, result) in results.iter().take(MAX_RESULTS).enumerate() {
            out.push_str(&format!(
                "{}. {}\n   {}\n   {}\n\n",
                i + 1,
                result.title,
                result.url,
                result.description.as_deref().unwrap_or(""),
            ));
        }
        ToolResult::ok(out.trim_end().to_string())
    }
}

#[derive(Deserialize)]
struct SearchApiResponse {
    web: Option<WebResults>,
}

#[derive(Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    title: String,
    url: String,
    description: Option<String>,
}

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page by URL and return its text content (truncated)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                }
            },
            "required": ["url"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Web
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let url = input.get("url").and_then(Value::as_str).unwrap_or("").trim();
        if url.is_empty() {
            return ToolResult::error("url must not be empty");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::error("url must start with http:// or https://");
        }

        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("fetch failed: {e}")),
        };

        let status = resp.status();
        if !status.is_success() {
            return ToolResult::error(format!("fetch returned status {status}"));
        }

        match resp.text().await {
            Ok(body) => {
                let text = strip_tags(&body);
                let truncated: String = text.chars().take(MAX_FETCH_CHARS).collect();
                ToolResult::ok(truncated)
            }
            Err(e) => ToolResult::error(format!("could not read body: {e}")),
        }
    }
}

/// Crude tag stripper — enough to keep fetched pages readable without
/// pulling in a full HTML parser.
fn strip_tags(html: &str) -> String {
    fn ahead_is(html: &str, idx: usize, prefix: &str) -> bool {
        html.get(idx..idx + prefix.len())
            .map(|s| s.eq_ignore_ascii_case(prefix))
            .unwrap_or(false)
    }

    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut in_script = false;

    let mut idx = 0;
    for ch in html.chars() {
        if !in_tag && ch == '<' {
            in_tag = true;
            if ahead_is(html, idx, "<script") || ahead_is(html, idx, "<style") {
                in_script = true;
            } else if in_script
                && (ahead_is(html, idx, "</script") || ahead_is(html, idx, "</style"))
            {
                in_script = false;
            }
        } else if in_tag && ch == '>' {
            in_tag = false;
        } else if !in_tag && !in_script {
            out.push(ch);
        }
        idx += ch.len_utf8();
    }

    // Collapse whitespace runs left behind by removed markup.
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
