use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token counts never change for the same text, so cache generously.
const CACHE_TTL: Duration = Duration::from_secs(3600);
/// Maximum cache entries before eviction.
const MAX_CACHE_ENTRIES: usize = 4096;

/// Approximate token counter used for all budgeting decisions.
///
/// The estimate is ~4 characters per token, which tracks Claude tokenisation
/// closely enough for trimming and consolidation thresholds. Correctness
/// requires only that the count is stable within a process and grows with
/// input length — both hold by construction.
pub struct TokenCounter {
    cache: Mutex<HashMap<u64, CacheSlot>>,
}

struct CacheSlot {
    count: usize,
    stamp: Instant,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Count tokens in `text`, consulting the cache first.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let key = hash_text(text);

        {
            let cache = self.cache.lock().unwrap();
            if let Some(slot) = cache.get(&key) {
                if slot.stamp.elapsed() < CACHE_TTL {
                    return slot.count;
                }
            }
        }

        let count = estimate_tokens(text);

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= MAX_CACHE_ENTRIES {
            // Evict the oldest entry
            let oldest = cache
                .iter()
                .min_by_key(|(_, slot)| slot.stamp)
                .map(|(k, _)| *k);
            if let Some(k) = oldest {
                cache.remove(&k);
            }
        }
        cache.insert(
            key,
            CacheSlot {
                count,
                stamp: Instant::now(),
            },
        );
        count
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// ~4 chars/token, rounded up, never zero for non-empty input.
fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_counts_zero() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn count_is_stable_across_calls() {
        let counter = TokenCounter::new();
        let text = "The quick brown fox jumps over the lazy dog.";
        let first = counter.count(text);
        let second = counter.count(text);
        assert_eq!(first, second);
        assert!(first > 0);
    }

    #[test]
    fn count_grows_with_input_length() {
        let counter = TokenCounter::new();
        let short = counter.count("hello");
        let long = counter.count(&"hello world ".repeat(100));
        assert!(long > short);
    }

    #[test]
    fn roughly_four_chars_per_token() {
        let counter = TokenCounter::new();
        let text = "a".repeat(4000);
        let count = counter.count(&text);
        assert_eq!(count, 1000);
    }
}
