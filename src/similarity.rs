// 🔍 Similarity Engine
// Scores two texts in [0, 1]: 1 = identical meaning, 0 = unrelated

use std::collections::HashMap;

use crate::error::SimilarityError;

/// Default cap on characters per input text.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 100_000;

/// A pluggable text-similarity engine.
///
/// Implementations must return a finite score within [0, 1] or an error.
pub trait SimilarityEngine: Send + Sync {
    fn similarity(&self, text1: &str, text2: &str) -> Result<f64, SimilarityError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

// ============================================================================
// LEXICAL COSINE ENGINE
// ============================================================================

/// Cosine similarity of term-frequency vectors.
///
/// Tokens are maximal runs of alphanumeric characters, lowercased. Two texts
/// without any token are identical (1.0); one empty side scores 0.0.
#[derive(Debug, Clone)]
pub struct LexicalSimilarity {
    max_input_chars: usize,
}

impl LexicalSimilarity {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }

    fn check_len(&self, text: &str) -> Result<(), SimilarityError> {
        let len = text.chars().count();
        if len > self.max_input_chars {
            return Err(SimilarityError::InputTooLarge {
                len,
                limit: self.max_input_chars,
            });
        }
        Ok(())
    }
}

impl Default for LexicalSimilarity {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUT_CHARS)
    }
}

/// Split text into lowercase alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<&str, f64> {
    let mut tf = HashMap::new();
    for token in tokens {
        *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
    }
    tf
}

impl SimilarityEngine for LexicalSimilarity {
    fn similarity(&self, text1: &str, text2: &str) -> Result<f64, SimilarityError> {
        self.check_len(text1)?;
        self.check_len(text2)?;

        let tokens1 = tokenize(text1);
        let tokens2 = tokenize(text2);

        match (tokens1.is_empty(), tokens2.is_empty()) {
            (true, true) => return Ok(1.0),
            (true, false) | (false, true) => return Ok(0.0),
            _ => {}
        }

        let tf1 = term_frequencies(&tokens1);
        let tf2 = term_frequencies(&tokens2);

        let dot: f64 = tf1
            .iter()
            .filter_map(|(term, a)| tf2.get(term).map(|b| a * b))
            .sum();
        let norm1: f64 = tf1.values().map(|v| v * v).sum::<f64>().sqrt();
        let norm2: f64 = tf2.values().map(|v| v * v).sum::<f64>().sqrt();

        let score = dot / (norm1 * norm2);
        if !score.is_finite() {
            return Err(SimilarityError::NonFinite);
        }

        Ok(score.clamp(0.0, 1.0))
    }

    fn name(&self) -> &'static str {
        "lexical-cosine"
    }
}
