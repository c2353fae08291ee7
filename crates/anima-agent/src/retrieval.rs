//! Per-turn automatic memory retrieval: dual-query search, significance
//! re-ranking, dedup against the session, retrieval accounting, and token
//! budgeting.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};

use anima_core::config::AnimaConfig;
use anima_db::Database;
use anima_memory::ranker::{
    self, FETCH_K_PER_QUERY,
};
use anima_memory::types::{MemoryEntry, MemorySource, SearchHit};
use anima_memory::VectorStore;
use anima_session::Session;

/// What one round of retrieval did to the session.
#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    /// Memories added to context this turn (new and restored).
    pub new_memories: Vec<MemoryEntry>,
    /// Subset that were first-time retrievals (counts were bumped).
    pub truly_new_ids: HashSet<String>,
    pub trimmed_memory_ids: Vec<String>,
    pub trimmed_context_messages: usize,
}

/// Run retrieval for one turn, mutate the session, and apply both token
/// budgets. Store failures degrade to "no candidates"; the turn proceeds.
pub async fn retrieve_and_budget(
    session: &mut Session,
    current_message: Option<&str>,
    db: &Database,
    store: Option<&VectorStore>,
    config: &AnimaConfig,
    count_tokens: &(dyn Fn(&str) -> usize + Send + Sync),
) -> RetrievalOutcome {
    let mut outcome = RetrievalOutcome::default();

    let entity_id = session
        .entity_id
        .clone()
        .or_else(|| config.default_entity().map(|e| e.index_name.clone()));

    match (store, entity_id) {
        (Some(store), Some(entity_id)) if store.is_configured(&entity_id) => {
            retrieve_into_session(
                session,
                current_message,
                db,
                store,
                config,
                &entity_id,
                &mut outcome,
            )
            .await;
        }
        (None, _) => {
            info!("memory retrieval skipped: vector store not configured");
        }
        (_, None) => {
            info!("memory retrieval skipped: no entity for this conversation");
        }
        (Some(_), Some(entity_id)) => {
            warn!(entity_id, "memory retrieval skipped: unknown entity index");
        }
    }

    // Budgets apply whether or not retrieval ran: reloads can overfill.
    outcome.trimmed_memory_ids =
        session.trim_memories_to_limit(config.retrieval.memory_token_limit, count_tokens);
    outcome.trimmed_context_messages = session.trim_context_to_limit(
        config.retrieval.context_token_limit,
        count_tokens,
        current_message,
    );

    outcome
}

async fn retrieve_into_session(
    session: &mut Session,
    current_message: Option<&str>,
    db: &Database,
    store: &VectorStore,
    config: &AnimaConfig,
    entity_id: &str,
    outcome: &mut RetrievalOutcome,
) {
    let (user_query, assistant_query) =
        ranker::derive_queries(&session.rolling_context, current_message);
    if user_query.is_none() && assistant_query.is_none() {
        return;
    }

    let is_default_entity = config
        .default_entity()
        .map(|e| e.index_name == entity_id)
        .unwrap_or(false);
    let archived = match db.archived_conversation_ids(Some((entity_id, is_default_entity))) {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "could not load archived conversations, excluding none");
            HashSet::new()
        }
    };

    // A session's first retrieval casts a wider net.
    let top_k = if session.retrieved_ids.is_empty() {
        config.retrieval.initial_retrieval_top_k
    } else {
        config.retrieval.retrieval_top_k
    };

    let conversation_id = session.conversation_id.clone();
    let mut user_hits: Vec<SearchHit> = Vec::new();
    let mut assistant_hits: Vec<SearchHit> = Vec::new();

    if let Some(query) = &user_query {
        user_hits = store
            .search(entity_id, query, FETCH_K_PER_QUERY, Some(&conversation_id))
            .await;
        info!(candidates = user_hits.len(), "user query search complete");
    }
    if let Some(query) = &assistant_query {
        assistant_hits = store
            .search(entity_id, query, FETCH_K_PER_QUERY, Some(&conversation_id))
            .await;
        info!(
            candidates = assistant_hits.len(),
            "assistant query search complete"
        );
    }

    // Union the candidate sets: higher score wins, both-queries tagged.
    let user_ids: HashSet<String> = user_hits.iter().map(|h| h.id.clone()).collect();
    let assistant_ids: HashSet<String> = assistant_hits.iter().map(|h| h.id.clone()).collect();
    let mut by_id: HashMap<String, SearchHit> = HashMap::new();
    for hit in user_hits.into_iter().chain(assistant_hits) {
        match by_id.get(&hit.id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                by_id.insert(hit.id.clone(), hit);
            }
        }
    }

    // Enrich from the database of record, applying the exclusion rules.
    let now = Utc::now();
    let mut enriched: Vec<MemoryEntry> = Vec::new();
    for (id, hit) in by_id {
        if let Some(conv_id) = &hit.conversation_id {
            if archived.contains(conv_id) {
                continue;
            }
        }
        if session.in_context_ids.contains(&id) {
            continue;
        }

        let record = match db.get_message(&id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(memory_id = %id, "skipping orphaned vector hit");
                continue;
            }
            Err(e) => {
                warn!(memory_id = %id, error = %e, "could not load candidate, skipping");
                continue;
            }
        };

        let significance = ranker::significance(
            record.times_retrieved,
            record.created_at,
            record.last_retrieved_at,
            now,
            &config.retrieval,
        );
        let combined = ranker::combined_score(hit.score, significance);

        let source = match (user_ids.contains(&id), assistant_ids.contains(&id)) {
            (true, true) => MemorySource::Both,
            (true, false) => MemorySource::User,
            (false, true) => MemorySource::Assistant,
            (false, false) => MemorySource::Unknown,
        };

        enriched.push(MemoryEntry {
            id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            role: record.role.to_string(),
            content: record.content.clone(),
            created_at: record.created_at,
            times_retrieved: record.times_retrieved,
            score: hit.score,
            significance,
            combined_score: combined,
            days_since_creation: (now - record.created_at).num_seconds() as f64 / 86_400.0,
            days_since_retrieval: record
                .last_retrieved_at
                .map(|t| (now - t).num_seconds() as f64 / 86_400.0),
            source,
        });
    }

    let selected = ranker::select_with_role_balance(enriched, top_k);
    let selected =
        ranker::apply_similarity_floor(selected, config.retrieval.similarity_threshold);

    let link_entity = if session.is_multi_entity {
        Some(entity_id)
    } else {
        None
    };

    for entry in selected {
        let (added, is_new_retrieval) = session.add_memory(entry.clone());
        if !added {
            continue;
        }
        info!(
            memory_id = %entry.id,
            combined = entry.combined_score,
            similarity = entry.score,
            significance = entry.significance,
            times_retrieved = entry.times_retrieved,
            source = %entry.source,
            restored = !is_new_retrieval,
            "memory added to context"
        );
        if is_new_retrieval {
            outcome.truly_new_ids.insert(entry.id.clone());
            if let Err(e) =
                db.increment_retrieval(&entry.id, &session.conversation_id, link_entity)
            {
                warn!(memory_id = %entry.id, error = %e, "retrieval count update failed");
            }
            store
                .update_times_retrieved(entity_id, &entry.id, entry.times_retrieved + 1)
                .await;
        }
        outcome.new_memories.push(entry);
    }

    if outcome.new_memories.is_empty() {
        info!(
            total_in_context = session.in_context_ids.len(),
            "no new memories retrieved"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_core::tokens::TokenCounter;

    #[tokio::test]
    async fn no_store_still_applies_budgets() {
        let db = Database::open_in_memory().expect("db");
        let config = AnimaConfig::default();
        let counter = TokenCounter::new();
        let count = |text: &str| counter.count(text);

        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);
        for i in 0..3 {
            session.add_exchange(Some(&format!("q{i}")), &format!("a{i}"));
        }

        let outcome =
            retrieve_and_budget(&mut session, Some("next"), &db, None, &config, &count).await;

        assert!(outcome.new_memories.is_empty());
        assert!(outcome.truly_new_ids.is_empty());
        assert!(outcome.trimmed_memory_ids.is_empty());
        assert_eq!(outcome.trimmed_context_messages, 0);
    }

    #[tokio::test]
    async fn budgets_trim_overfull_context_without_store() {
        let db = Database::open_in_memory().expect("db");
        let mut config = AnimaConfig::default();
        config.retrieval.context_token_limit = 20;
        let counter = TokenCounter::new();
        let count = |text: &str| counter.count(text);

        let mut session = Session::new("c1", "claude-sonnet-4-5", 1.0, 4096);
        for i in 0..10 {
            session.add_exchange(
                Some(&format!("question number {i} with padding")),
                &format!("answer number {i} with padding"),
            );
        }

        let outcome =
            retrieve_and_budget(&mut session, Some("next"), &db, None, &config, &count).await;
        assert!(outcome.trimmed_context_messages > 0);
    }
}
