//! Tokenizer contract consumed by the cache for prompts and debug rendering

use crate::TokenId;

/// Text <-> token id conversion supplied by the model side
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Decode token ids back into text
    fn decode(&self, tokens: &[TokenId]) -> String;
}

/// One token per Unicode scalar value.
///
/// Useful for demos and tests where a real vocabulary is not available: shared
/// text prefixes become shared token prefixes one-to-one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(|c| TokenId(c as u32)).collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        tokens
            .iter()
            .map(|t| char::from_u32(t.0).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}
