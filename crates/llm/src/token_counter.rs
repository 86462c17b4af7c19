//! Cached per-model token counting.

use std::sync::Arc;

use dashmap::DashMap;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model};

/// Maps model names to tokenizers and counts tokens.
///
/// Encoders are cached by model name. Models tiktoken does not know fall
/// back to the `cl100k_base` encoding, which gives a reasonable
/// approximation for budget enforcement across providers.
pub struct TokenCounter {
    encoders: DashMap<String, Arc<CoreBPE>>,
}

impl TokenCounter {
    /// An empty counter. Encoders are created lazily on first use.
    pub fn new() -> Self {
        Self {
            encoders: DashMap::new(),
        }
    }

    /// Count the tokens of `text` under the tokenizer of `model`.
    pub fn count(&self, model: &str, text: &str) -> usize {
        self.encoder(model).encode_ordinary(text).len()
    }

    /// Release all cached encoders and their native resources.
    pub fn clear(&self) {
        self.encoders.clear();
    }

    fn encoder(&self, model: &str) -> Arc<CoreBPE> {
        if let Some(encoder) = self.encoders.get(model) {
            return encoder.clone();
        }

        let encoder = Arc::new(get_bpe_from_model(model).unwrap_or_else(|_| {
            log::debug!("No tokenizer known for model '{model}', falling back to cl100k_base");
            cl100k_base().expect("cl100k_base is bundled with tiktoken-rs")
        }));

        self.encoders.insert(model.to_string(), encoder.clone());

        encoder
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_positive_for_text() {
        let counter = TokenCounter::new();

        let tokens = counter.count("gpt-4", "Hello, how are you?");
        assert!(tokens > 0);
        assert!(tokens < 20);
    }

    #[test]
    fn empty_text_counts_zero() {
        let counter = TokenCounter::new();

        assert_eq!(counter.count("gpt-4", ""), 0);
    }

    #[test]
    fn unknown_model_falls_back() {
        let counter = TokenCounter::new();

        let known = counter.count("gpt-4", "budget enforcement");
        let unknown = counter.count("some-internal-model", "budget enforcement");

        // Both resolve to cl100k-family encoders, so the counts agree.
        assert_eq!(known, unknown);
    }

    #[test]
    fn clear_releases_encoders() {
        let counter = TokenCounter::new();

        counter.count("gpt-4", "warm the cache");
        counter.clear();

        // Still usable after clearing.
        assert!(counter.count("gpt-4", "warm the cache") > 0);
    }
}
