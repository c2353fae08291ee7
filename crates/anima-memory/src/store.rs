use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use anima_core::config::{AnimaConfig, VectorStoreConfig};

use crate::cache::SearchCache;
use crate::error::{MemoryError, Result};
use crate::types::SearchHit;

const API_VERSION: &str = "2025-01";
/// Vector-store calls get a short bounded timeout; exceeding it is treated
/// as "no candidates", never as a turn failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONTENT_PREVIEW_CHARS: usize = 200;
const LIST_PAGE_SIZE: usize = 100;

/// Vector store adapter — one logical index per entity id.
///
/// The store generates embeddings itself (integrated inference); we only
/// ever pass raw text. Every operation is soft-failing: errors are logged
/// and surfaced as empty results or `false`, because a turn without
/// memories beats a failed turn.
pub struct VectorStore {
    client: reqwest::Client,
    api_key: String,
    /// entity id (index name) → data-plane host.
    hosts: HashMap<String, String>,
    cache: SearchCache,
}

/// A record to upsert: raw text plus the metadata the ranker needs later.
#[derive(Debug, Clone)]
pub struct UpsertRecord {
    pub id: String,
    pub text: String,
    pub conversation_id: String,
    pub created_at: String,
    pub role: String,
    pub times_retrieved: u32,
}

impl VectorStore {
    /// Build from config. Entities without a data-plane host get the
    /// conventional serverless hostname derived from the index name.
    pub fn from_config(config: &AnimaConfig) -> Option<Self> {
        let store_config = config.providers.vector_store.as_ref()?;
        let hosts = config
            .entities
            .iter()
            .map(|e| {
                let host = e
                    .host
                    .clone()
                    .unwrap_or_else(|| format!("https://{}.svc.pinecone.io", e.index_name));
                (e.index_name.clone(), host)
            })
            .collect();
        Some(Self::new(store_config, hosts))
    }

    pub fn new(config: &VectorStoreConfig, hosts: HashMap<String, String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: config.api_key.clone(),
            hosts,
            cache: SearchCache::new(),
        }
    }

    /// Whether an index is configured for this entity.
    pub fn is_configured(&self, entity_id: &str) -> bool {
        self.hosts.contains_key(entity_id)
    }

    fn host(&self, entity_id: &str) -> Result<&str> {
        self.hosts
            .get(entity_id)
            .map(String::as_str)
            .ok_or_else(|| MemoryError::NoIndex {
                entity_id: entity_id.to_string(),
            })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .header("content-type", "application/json")
    }

    // ── operations ───────────────────────────────────────────────────────

    /// Store a message as a memory. Idempotent on id. Returns false (and
    /// logs) on any failure — callers treat this as a health signal only.
    pub async fn upsert(&self, entity_id: &str, record: UpsertRecord) -> bool {
        match self.try_upsert(entity_id, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(entity_id, error = %e, "memory upsert failed");
                false
            }
        }
    }

    async fn try_upsert(&self, entity_id: &str, record: UpsertRecord) -> Result<()> {
        let host = self.host(entity_id)?;
        let url = format!("{host}/records/namespaces/__default__/upsert");

        let preview: String = record.text.chars().take(CONTENT_PREVIEW_CHARS).collect();
        let body = json!({
            "_id": record.id,
            "text": record.text,
            "conversation_id": record.conversation_id,
            "created_at": record.created_at,
            "role": record.role,
            "content_preview": preview,
            "times_retrieved": record.times_retrieved,
        });

        let resp = self
            .request(reqwest::Method::POST, url)
            .body(body.to_string())
            .send()
            .await?;
        check_status(resp).await?;
        debug!(entity_id, "memory upserted");
        Ok(())
    }

    /// Semantic search, `exclude_conversation` filtered at the store level.
    /// Results are ordered by score descending, at most `k` of them, and
    /// memoised for 60 seconds. Failures return an empty list.
    pub async fn search(
        &self,
        entity_id: &str,
        query: &str,
        k: usize,
        exclude_conversation: Option<&str>,
    ) -> Vec<SearchHit> {
        if let Some(hits) = self.cache.get(entity_id, query, k, exclude_conversation) {
            debug!(entity_id, "memory search cache hit");
            return hits;
        }

        match self
            .try_search(entity_id, query, k, exclude_conversation)
            .await
        {
            Ok(hits) => {
                self.cache
                    .put(entity_id, query, k, exclude_conversation, hits.clone());
                hits
            }
            Err(e) => {
                warn!(entity_id, error = %e, "memory search failed, returning no candidates");
                Vec::new()
            }
        }
    }

    async fn try_search(
        &self,
        entity_id: &str,
        query: &str,
        k: usize,
        exclude_conversation: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let host = self.host(entity_id)?;
        let url = format!("{host}/records/namespaces/__default__/search");

        let mut search_query = json!({
            "inputs": { "text": query },
            "top_k": k,
        });
        if let Some(conv_id) = exclude_conversation {
            search_query["filter"] = json!({ "conversation_id": { "$ne": conv_id } });
        }

        let resp = self
            .request(reqwest::Method::POST, url)
            .body(json!({ "query": search_query }).to_string())
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Parse(e.to_string()))?;

        let mut hits = Vec::new();
        for hit in parsed.result.hits {
            // The store-level filter should already exclude the current
            // conversation; drop stragglers to keep the contract exact.
            if let Some(conv_id) = exclude_conversation {
                if hit.fields.conversation_id.as_deref() == Some(conv_id) {
                    continue;
                }
            }
            hits.push(SearchHit {
                id: hit.id,
                score: hit.score,
                conversation_id: hit.fields.conversation_id,
                created_at: hit.fields.created_at,
                role: hit.fields.role,
                content_preview: hit.fields.content_preview,
                times_retrieved: hit.fields.times_retrieved.unwrap_or(0),
            });
        }

        info!(entity_id, candidates = hits.len(), "memory search complete");
        Ok(hits)
    }

    /// Delete a memory. Idempotent; returns false on transport failure.
    pub async fn delete(&self, entity_id: &str, id: &str) -> bool {
        match self.try_delete(entity_id, id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(entity_id, id, error = %e, "memory delete failed");
                false
            }
        }
    }

    async fn try_delete(&self, entity_id: &str, id: &str) -> Result<()> {
        let host = self.host(entity_id)?;
        let url = format!("{host}/vectors/delete");
        let resp = self
            .request(reqwest::Method::POST, url)
            .body(json!({ "ids": [id], "namespace": "__default__" }).to_string())
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    /// Best-effort metadata bump after a first-time retrieval. A failure is
    /// logged and ignored — the database of record is authoritative.
    pub async fn update_times_retrieved(&self, entity_id: &str, id: &str, times_retrieved: u32) {
        let result: Result<()> = async {
            let host = self.host(entity_id)?;
            let url = format!("{host}/vectors/update");
            let resp = self
                .request(reqwest::Method::POST, url)
                .body(
                    json!({
                        "id": id,
                        "setMetadata": { "times_retrieved": times_retrieved },
                        "namespace": "__default__",
                    })
                    .to_string(),
                )
                .send()
                .await?;
            check_status(resp).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(entity_id, id, error = %e, "could not update vector metadata");
        }
    }

    /// Enumerate every record id in an entity's index, paginating until
    /// exhausted. Failures return what was collected so far.
    pub async fn list_ids(&self, entity_id: &str) -> Vec<String> {
        let mut all_ids = Vec::new();
        let mut token: Option<String> = None;

        loop {
            match self.list_page(entity_id, token.as_deref()).await {
                Ok(page) => {
                    all_ids.extend(page.ids);
                    match page.next {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(entity_id, error = %e, "listing vector ids failed");
                    break;
                }
            }
        }

        info!(entity_id, count = all_ids.len(), "listed vector record ids");
        all_ids
    }

    async fn list_page(&self, entity_id: &str, token: Option<&str>) -> Result<ListPage> {
        let host = self.host(entity_id)?;
        let mut url = format!("{host}/vectors/list?namespace=__default__&limit={LIST_PAGE_SIZE}");
        if let Some(t) = token {
            url.push_str(&format!("&paginationToken={t}"));
        }

        let resp = self.request(reqwest::Method::GET, url).send().await?;
        let resp = check_status(resp).await?;
        let parsed: ListResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Parse(e.to_string()))?;

        Ok(ListPage {
            ids: parsed.vectors.into_iter().map(|v| v.id).collect(),
            next: parsed.pagination.and_then(|p| p.next),
        })
    }

    /// Ids present in the index but absent from the database of record.
    /// These accumulate when a message delete loses the race against the
    /// index, or after a database restore.
    pub async fn orphaned_ids(&self, entity_id: &str, known_ids: &HashSet<String>) -> Vec<String> {
        let index_ids = self.list_ids(entity_id).await;
        let orphans: Vec<String> = index_ids
            .into_iter()
            .filter(|id| !known_ids.contains(id))
            .collect();
        info!(entity_id, orphans = orphans.len(), "orphan scan complete");
        orphans
    }

    /// Delete orphaned records. With `dry_run` nothing is deleted; the
    /// would-be victims are just reported.
    pub async fn cleanup_orphans(
        &self,
        entity_id: &str,
        known_ids: &HashSet<String>,
        dry_run: bool,
    ) -> OrphanCleanup {
        let orphan_ids = self.orphaned_ids(entity_id, known_ids).await;
        let mut deleted = 0usize;

        if !dry_run {
            for id in &orphan_ids {
                if self.delete(entity_id, id).await {
                    deleted += 1;
                }
            }
        }

        OrphanCleanup {
            found: orphan_ids.len(),
            deleted,
            dry_run,
            orphan_ids,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrphanCleanup {
    pub found: usize,
    pub deleted: usize,
    pub dry_run: bool,
    pub orphan_ids: Vec<String>,
}

struct ListPage {
    ids: Vec<String>,
    next: Option<String>,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(MemoryError::Api {
        status: status.as_u16(),
        message,
    })
}

// Vector store wire types (private — deserialization only)

#[derive(Deserialize)]
struct SearchResponse {
    result: SearchResult,
}

#[derive(Deserialize)]
struct SearchResult {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: f64,
    #[serde(default)]
    fields: RawFields,
}

#[derive(Deserialize, Default)]
struct RawFields {
    conversation_id: Option<String>,
    created_at: Option<String>,
    role: Option<String>,
    content_preview: Option<String>,
    times_retrieved: Option<u32>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    vectors: Vec<ListVector>,
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
struct ListVector {
    id: String,
}

#[derive(Deserialize)]
struct Pagination {
    next: Option<String>,
}
