//! Pure ranking arithmetic — no I/O, no suspension points.
//!
//! Candidates arrive as similarity-ordered vector hits; these functions
//! re-rank them by similarity x significance, repair one-sided role
//! selections, and apply the similarity floor.

use chrono::{DateTime, Utc};
use tracing::info;

use anima_core::config::RetrievalConfig;
use anima_core::content::{ApiRole, ContextMessage};

use crate::types::MemoryEntry;

/// Candidates fetched per query before re-ranking.
pub const FETCH_K_PER_QUERY: usize = 10;

/// Derive the (user_query, assistant_query) pair for similarity search.
///
/// The user query is the current turn; the assistant query is the most
/// recent assistant message in the rolling context. On a continuation
/// (no current message) only the assistant query is issued, falling back
/// to the last user message if no assistant turn exists yet.
pub fn derive_queries(
    context: &[ContextMessage],
    current_message: Option<&str>,
) -> (Option<String>, Option<String>) {
    let last_assistant = context
        .iter()
        .rev()
        .find(|m| m.role == ApiRole::Assistant)
        .map(|m| m.content.display_text());

    match current_message {
        Some(msg) => (Some(msg.to_string()), last_assistant),
        None => {
            if last_assistant.is_some() {
                (None, last_assistant)
            } else {
                let last_user = context
                    .iter()
                    .rev()
                    .find(|m| m.role == ApiRole::User)
                    .map(|m| m.content.display_text());
                (last_user, None)
            }
        }
    }
}

/// Significance of a memory given its retrieval history.
///
/// `significance = times_retrieved * recency_factor * half_life_modifier`,
/// floored at `significance_floor`. Whole days, matching the stored
/// day-granular timestamps.
pub fn significance(
    times_retrieved: u32,
    created_at: DateTime<Utc>,
    last_retrieved_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &RetrievalConfig,
) -> f64 {
    let days_since_creation = (now - created_at).num_days().max(0) as f64;
    let half_life_modifier =
        0.5_f64.powf(days_since_creation / config.significance_half_life_days);

    let recency_factor = match last_retrieved_at {
        None => 1.0,
        Some(last) => {
            let days_since_retrieval = (now - last).num_days().max(0);
            if days_since_retrieval > 0 {
                1.0 + (1.0 / days_since_retrieval as f64).min(config.recency_boost_strength)
            } else {
                1.0 + config.recency_boost_strength
            }
        }
    };

    let significance = times_retrieved as f64 * recency_factor * half_life_modifier;
    significance.max(config.significance_floor)
}

/// Similarity boosted by significance — the ranking key.
pub fn combined_score(similarity: f64, significance: f64) -> f64 {
    similarity * (1.0 + significance)
}

/// Sort by combined score, keep `top_k`, and repair one-sided selections:
/// if every selected memory shares one role in {human, assistant} while the
/// other role exists in the wider pool, the lowest-scored selection is
/// replaced with the best candidate of the missing role.
pub fn select_with_role_balance(mut ranked: Vec<MemoryEntry>, top_k: usize) -> Vec<MemoryEntry> {
    if ranked.is_empty() || top_k == 0 {
        return Vec::new();
    }

    ranked.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<MemoryEntry> = ranked.iter().take(top_k).cloned().collect();
    if selected.len() < 2 {
        return selected;
    }

    let human_count = selected.iter().filter(|m| m.role == "human").count();
    let assistant_count = selected.iter().filter(|m| m.role == "assistant").count();

    if human_count > 0 && assistant_count > 0 {
        return selected;
    }

    let needed_role = if human_count > 0 && assistant_count == 0 {
        "assistant"
    } else if assistant_count > 0 && human_count == 0 {
        "human"
    } else {
        // Neither canonical role present (all other-entity labels) — leave it.
        return selected;
    };

    // First match is the highest scored of that role, since ranked is sorted.
    let replacement = match ranked.iter().find(|m| m.role == needed_role) {
        Some(m) => m.clone(),
        None => {
            info!(needed_role, "role balance: missing role absent from candidate pool");
            return selected;
        }
    };

    if selected.iter().any(|m| m.id == replacement.id) {
        return selected;
    }

    info!(
        needed_role,
        replacement_score = replacement.combined_score,
        "role balance: replacing lowest-scored selection"
    );
    let last = selected.len() - 1;
    selected[last] = replacement;
    selected
}

/// Drop selections whose raw similarity falls below the floor. Applied
/// after ranking so a highly-significant memory still cannot ride in on a
/// weak match.
pub fn apply_similarity_floor(selected: Vec<MemoryEntry>, threshold: f64) -> Vec<MemoryEntry> {
    selected.into_iter().filter(|m| m.score >= threshold).collect()
}
