use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::SearchHit;

/// Search results expire after 60 seconds — long enough to serve the
/// repeated near-identical queries of a multi-turn burst, short enough
/// that fresh memories appear promptly.
const CACHE_TTL: Duration = Duration::from_secs(60);
/// Maximum cache entries before eviction.
const MAX_CACHE_ENTRIES: usize = 256;

/// Short-TTL memo of raw vector-search candidate lists, keyed on
/// (entity, query, k, exclusion filter). Stores results *before* in-core
/// filtering so different exclusion sets can share one upstream call.
pub struct SearchCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    hits: Vec<SearchHit>,
    stamp: Instant,
}

impl SearchCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        entity_id: &str,
        query: &str,
        k: usize,
        exclude_conversation: Option<&str>,
    ) -> Option<Vec<SearchHit>> {
        let key = cache_key(entity_id, query, k, exclude_conversation);
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&key)?;
        if entry.stamp.elapsed() < CACHE_TTL {
            Some(entry.hits.clone())
        } else {
            None
        }
    }

    pub fn put(
        &self,
        entity_id: &str,
        query: &str,
        k: usize,
        exclude_conversation: Option<&str>,
        hits: Vec<SearchHit>,
    ) {
        let key = cache_key(entity_id, query, k, exclude_conversation);
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_CACHE_ENTRIES {
            // Evict oldest entry
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                entries.remove(&k);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                hits,
                stamp: Instant::now(),
            },
        );
    }
}

impl Default for SearchCache {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(
    entity_id: &str,
    query: &str,
    k: usize,
    exclude_conversation: Option<&str>,
) -> String {
    format!(
        "{entity_id}|{k}|{}|{}",
        exclude_conversation.unwrap_or("-"),
        normalise_query(query),
    )
}

/// Trim and collapse whitespace so trivially-reformatted queries share a
/// cache slot.
fn normalise_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score,
            conversation_id: Some("conv".to_string()),
            created_at: None,
            role: None,
            content_preview: None,
            times_retrieved: 0,
        }
    }

    #[test]
    fn put_then_get_returns_hits() {
        let cache = SearchCache::new();
        cache.put("e", "what is rust", 10, Some("c1"), vec![hit("m1", 0.9)]);
        let got = cache.get("e", "what is rust", 10, Some("c1")).expect("hit");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "m1");
    }

    #[test]
    fn key_includes_entity_k_and_filter() {
        let cache = SearchCache::new();
        cache.put("e", "q", 10, Some("c1"), vec![hit("m1", 0.9)]);
        assert!(cache.get("other", "q", 10, Some("c1")).is_none());
        assert!(cache.get("e", "q", 5, Some("c1")).is_none());
        assert!(cache.get("e", "q", 10, Some("c2")).is_none());
        assert!(cache.get("e", "q", 10, None).is_none());
    }

    #[test]
    fn whitespace_variants_share_a_slot() {
        let cache = SearchCache::new();
        cache.put("e", "  what   is\trust ", 10, None, vec![hit("m1", 0.9)]);
        assert!(cache.get("e", "what is rust", 10, None).is_some());
    }
}
