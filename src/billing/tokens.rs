//! Token counting for pricing when an upstream response omits usage, or
//! for a pre-flight PreDebit estimate before the response is even sent.
//!
//! Three escalating fidelity levels (character / word / approximate), a
//! Chinese-text heuristic for the approximate method, and a short TTL
//! cache keyed by `(model, hash(prompt), hash(completion))` so repeated
//! retries of the same request body don't re-tokenize it.

use dashmap::DashMap;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMethod {
    Character,
    Word,
    Approximate,
}

pub struct TokenCounter {
    method: CountMethod,
    model_ratios: HashMap<String, f64>,
    cache: DashMap<(String, u64, u64), (u32, u32, Instant)>,
    cache_ttl: Duration,
}

impl TokenCounter {
    pub fn new(method: CountMethod, cache_ttl: Duration) -> Self {
        Self {
            method,
            model_ratios: HashMap::new(),
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Per-model fudge factor applied on top of the approximate count,
    /// e.g. a model whose tokenizer splits more aggressively than the
    /// heuristic assumes.
    pub fn with_model_ratio(mut self, model: impl Into<String>, ratio: f64) -> Self {
        self.model_ratios.insert(model.into(), ratio);
        self
    }

    /// Returns `(prompt_tokens, completion_tokens)`, using the cache when
    /// the same `(model, prompt, completion)` triple was counted recently.
    pub fn count(&self, model: &str, prompt: &str, completion: &str) -> (u32, u32) {
        let key = (model.to_string(), hash_of(prompt), hash_of(completion));
        if let Some(cached) = self.cache.get(&key) {
            if cached.2.elapsed() < self.cache_ttl {
                return (cached.0, cached.1);
            }
        }

        let ratio = self.model_ratios.get(model).copied().unwrap_or(1.0);
        let prompt_tokens = (self.count_text(prompt) as f64 * ratio).round() as u32;
        let completion_tokens = (self.count_text(completion) as f64 * ratio).round() as u32;

        self.cache.insert(key, (prompt_tokens, completion_tokens, Instant::now()));
        (prompt_tokens, completion_tokens)
    }

    fn count_text(&self, text: &str) -> u32 {
        match self.method {
            CountMethod::Character => text.chars().count() as u32,
            CountMethod::Word => text.split_whitespace().count() as u32,
            CountMethod::Approximate => approximate_tokens(text),
        }
    }
}

/// CJK ideographs count roughly one token apiece; everything else is
/// approximated at four characters per token, the common English rule of
/// thumb. Whitespace is excluded from the non-CJK tally.
fn approximate_tokens(text: &str) -> u32 {
    let mut cjk = 0u32;
    let mut other = 0u32;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else if !c.is_whitespace() {
            other += 1;
        }
    }
    cjk + ((other as f64) / 4.0).ceil() as u32
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF |
        0x3400..=0x4DBF |
        0x3040..=0x30FF |
        0xAC00..=0xD7A3
    )
}

fn hash_of(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approximate_counts_english_at_four_chars_per_token() {
        let text = "a".repeat(40);
        assert_eq!(approximate_tokens(&text), 10);
    }

    #[test]
    fn approximate_counts_cjk_near_one_token_per_char() {
        let text = "你好世界";
        assert_eq!(approximate_tokens(text), 4);
    }

    #[test]
    fn mixed_text_combines_both_heuristics() {
        let text = "你好 hello";
        // 2 CJK chars + "hello" (5 chars) / 4 rounded up = 2 + 2 = 4
        assert_eq!(approximate_tokens(text), 4);
    }

    #[test]
    fn model_ratio_scales_the_result() {
        let counter = TokenCounter::new(CountMethod::Character, Duration::from_secs(30))
            .with_model_ratio("verbose-model", 2.0);
        let (prompt, _) = counter.count("verbose-model", "abcd", "");
        assert_eq!(prompt, 8);
    }

    #[test]
    fn repeated_count_hits_the_cache() {
        let counter = TokenCounter::new(CountMethod::Word, Duration::from_secs(30));
        let first = counter.count("gpt-4", "hello world", "hi");
        let second = counter.count("gpt-4", "hello world", "hi");
        assert_eq!(first, second);
    }
}
